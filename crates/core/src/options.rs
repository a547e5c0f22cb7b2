//! Typed processing options attached to every job.
//!
//! Options are validated once at the submission boundary and are immutable
//! afterwards; the worker only reads them when rendering the pipeline config
//! and choosing the model argument.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;

/// Default cartilage smoothing variance passed to the pipeline.
pub const DEFAULT_CARTILAGE_SMOOTHING: f64 = 0.3125;

// ---------------------------------------------------------------------------
// SegmentationModel
// ---------------------------------------------------------------------------

/// Segmentation model selectable at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationModel {
    #[default]
    NnunetFullres,
    NnunetCascade,
    DosmaAnanya,
    GoyalSagittal,
    GoyalCoronal,
    GoyalAxial,
    Staple,
}

impl SegmentationModel {
    pub const ALL: [SegmentationModel; 7] = [
        Self::NnunetFullres,
        Self::NnunetCascade,
        Self::DosmaAnanya,
        Self::GoyalSagittal,
        Self::GoyalCoronal,
        Self::GoyalAxial,
        Self::Staple,
    ];

    /// Name used in the HTTP API.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NnunetFullres => "nnunet_fullres",
            Self::NnunetCascade => "nnunet_cascade",
            Self::DosmaAnanya => "dosma_ananya",
            Self::GoyalSagittal => "goyal_sagittal",
            Self::GoyalCoronal => "goyal_coronal",
            Self::GoyalAxial => "goyal_axial",
            Self::Staple => "staple",
        }
    }

    /// Model name understood by the pipeline command line.
    ///
    /// Both nnU-Net variants share one model; the variant is selected via
    /// `nnunet.type` in the generated config.
    pub fn pipeline_model_name(self) -> &'static str {
        match self {
            Self::NnunetFullres | Self::NnunetCascade => "nnunet_knee",
            Self::DosmaAnanya => "acl_qdess_bone_july_2024",
            Self::GoyalSagittal => "goyal_sagittal",
            Self::GoyalCoronal => "goyal_coronal",
            Self::GoyalAxial => "goyal_axial",
            Self::Staple => "staple",
        }
    }

    pub fn is_cascade(self) -> bool {
        matches!(self, Self::NnunetCascade)
    }
}

impl fmt::Display for SegmentationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentationModel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| {
                let valid: Vec<_> = Self::ALL.iter().map(|m| m.as_str()).collect();
                CoreError::Validation(format!(
                    "Invalid segmentation_model '{s}'. Must be one of: {}",
                    valid.join(", ")
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// NsmType
// ---------------------------------------------------------------------------

/// Which Neural Shape Model analyses to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NsmType {
    #[default]
    BoneAndCart,
    BoneOnly,
    Both,
    None,
}

impl NsmType {
    pub const ALL: [NsmType; 4] = [Self::BoneAndCart, Self::BoneOnly, Self::Both, Self::None];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BoneAndCart => "bone_and_cart",
            Self::BoneOnly => "bone_only",
            Self::Both => "both",
            Self::None => "none",
        }
    }
}

impl FromStr for NsmType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Invalid nsm_type '{s}'. Must be one of: bone_and_cart, bone_only, both, none"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// JobOptions
// ---------------------------------------------------------------------------

/// Processing options chosen by the submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct JobOptions {
    #[serde(default)]
    pub segmentation_model: SegmentationModel,
    #[serde(default = "default_true")]
    pub perform_nsm: bool,
    #[serde(default)]
    pub nsm_type: NsmType,
    #[validate(range(min = 0.0, max = 2.0))]
    #[serde(default = "default_smoothing")]
    pub cartilage_smoothing: f64,
    #[validate(range(min = 1, max = 256))]
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub clip_femur_top: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_smoothing() -> f64 {
    DEFAULT_CARTILAGE_SMOOTHING
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            segmentation_model: SegmentationModel::default(),
            perform_nsm: true,
            nsm_type: NsmType::default(),
            cartilage_smoothing: DEFAULT_CARTILAGE_SMOOTHING,
            batch_size: None,
            clip_femur_top: None,
        }
    }
}

impl JobOptions {
    /// Validate numeric bounds, mapping failures to [`CoreError::Validation`].
    pub fn validated(self) -> Result<Self, CoreError> {
        if self.cartilage_smoothing.is_nan() {
            return Err(CoreError::Validation(
                "cartilage_smoothing must be a number".into(),
            ));
        }
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        Ok(self)
    }

    /// Whether the bone + cartilage shape model should run.
    pub fn bone_and_cart_nsm(&self) -> bool {
        self.perform_nsm && matches!(self.nsm_type, NsmType::BoneAndCart | NsmType::Both)
    }

    /// Whether the bone-only shape model should run.
    pub fn bone_only_nsm(&self) -> bool {
        self.perform_nsm && matches!(self.nsm_type, NsmType::BoneOnly | NsmType::Both)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_match_upload_form() {
        let opts = JobOptions::default();
        assert_eq!(opts.segmentation_model, SegmentationModel::NnunetFullres);
        assert!(opts.perform_nsm);
        assert_eq!(opts.nsm_type, NsmType::BoneAndCart);
        assert_eq!(opts.cartilage_smoothing, DEFAULT_CARTILAGE_SMOOTHING);
    }

    #[test]
    fn model_round_trips_through_str() {
        for model in SegmentationModel::ALL {
            assert_eq!(model.as_str().parse::<SegmentationModel>().unwrap(), model);
        }
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert_matches!(
            "resnet".parse::<SegmentationModel>(),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn nnunet_variants_share_pipeline_model() {
        assert_eq!(SegmentationModel::NnunetFullres.pipeline_model_name(), "nnunet_knee");
        assert_eq!(SegmentationModel::NnunetCascade.pipeline_model_name(), "nnunet_knee");
        assert!(SegmentationModel::NnunetCascade.is_cascade());
    }

    #[test]
    fn smoothing_out_of_range_fails_validation() {
        let opts = JobOptions {
            cartilage_smoothing: 2.5,
            ..JobOptions::default()
        };
        assert_matches!(opts.validated(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn batch_size_bounds_are_enforced() {
        let zero = JobOptions {
            batch_size: Some(0),
            ..JobOptions::default()
        };
        assert!(zero.validated().is_err());

        let max = JobOptions {
            batch_size: Some(256),
            ..JobOptions::default()
        };
        assert!(max.validated().is_ok());
    }

    #[test]
    fn nsm_flags_follow_type_and_switch() {
        let both = JobOptions {
            nsm_type: NsmType::Both,
            ..JobOptions::default()
        };
        assert!(both.bone_and_cart_nsm());
        assert!(both.bone_only_nsm());

        let disabled = JobOptions {
            perform_nsm: false,
            ..both
        };
        assert!(!disabled.bone_and_cart_nsm());
        assert!(!disabled.bone_only_nsm());

        let none = JobOptions {
            nsm_type: NsmType::None,
            ..JobOptions::default()
        };
        assert!(!none.bone_and_cart_nsm());
    }

    #[test]
    fn deserializes_with_missing_fields() {
        let opts: JobOptions =
            serde_json::from_value(serde_json::json!({"segmentation_model": "staple"})).unwrap();
        assert_eq!(opts.segmentation_model, SegmentationModel::Staple);
        assert!(opts.perform_nsm);
        assert_eq!(opts.batch_size, None);
    }
}
