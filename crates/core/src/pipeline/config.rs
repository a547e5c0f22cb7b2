//! Per-job pipeline configuration.
//!
//! The pipeline reads a JSON config named by `KNEEPIPELINE_CONFIG`. Each job
//! gets its own copy: the base config with the submitter's options laid on
//! top.

use std::path::Path;

use serde_json::{json, Map, Value};

use super::failure::{FailureKind, PipelineFailure};
use crate::options::JobOptions;

/// Overlay `options` onto `base`.
///
/// A base that is not a JSON object is replaced by an empty object; a
/// missing or non-object `nnunet` section is created.
pub fn render_config(base: Value, options: &JobOptions) -> Value {
    let mut config = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    config.insert(
        "default_seg_model".into(),
        json!(options.segmentation_model.pipeline_model_name()),
    );

    let nnunet_type = if options.segmentation_model.is_cascade() {
        "cascade"
    } else {
        "fullres"
    };
    let nnunet = config
        .entry("nnunet")
        .or_insert_with(|| Value::Object(Map::new()));
    if !nnunet.is_object() {
        *nnunet = Value::Object(Map::new());
    }
    if let Value::Object(section) = nnunet {
        section.insert("type".into(), json!(nnunet_type));
    }

    config.insert(
        "perform_bone_and_cart_nsm".into(),
        json!(options.bone_and_cart_nsm()),
    );
    config.insert(
        "perform_bone_only_nsm".into(),
        json!(options.bone_only_nsm()),
    );
    config.insert(
        "image_smooth_var_cart".into(),
        json!(options.cartilage_smoothing),
    );
    if let Some(batch_size) = options.batch_size {
        config.insert("batch_size".into(), json!(batch_size));
    }
    if let Some(clip) = options.clip_femur_top {
        config.insert("clip_femur_top".into(), json!(clip));
    }

    Value::Object(config)
}

/// Read the base config, render it for `options` and write it to `dest`.
///
/// A missing or unparseable base config is a [`FailureKind::Config`]
/// failure.
pub async fn write_job_config(
    base_path: &Path,
    dest: &Path,
    options: &JobOptions,
) -> Result<(), PipelineFailure> {
    let raw = tokio::fs::read(base_path).await.map_err(|e| {
        PipelineFailure::new(
            FailureKind::Config,
            format!("Base config not found: {}: {e}", base_path.display()),
        )
    })?;
    let base: Value = serde_json::from_slice(&raw).map_err(|e| {
        PipelineFailure::new(
            FailureKind::Config,
            format!("Invalid base config {}: {e}", base_path.display()),
        )
    })?;

    let rendered = render_config(base, options);
    let body = serde_json::to_vec_pretty(&rendered)
        .map_err(|e| PipelineFailure::new(FailureKind::Config, e.to_string()))?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineFailure::io("Failed to create job directory", &e))?;
    }
    tokio::fs::write(dest, body)
        .await
        .map_err(|e| PipelineFailure::io("Failed to write job config", &e))?;
    Ok(())
}
