//! Verification and packaging of pipeline outputs.
//!
//! Blocking filesystem work; the worker calls these through
//! `spawn_blocking`.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Whether a top-level output entry looks like a pipeline result.
///
/// Segmentations (`*seg*.nii.gz`, `*seg*.nrrd`, `segmentation*`) and any
/// other volume or tabular result (`.nii.gz`, `.nrrd`, `.json`, `.csv`).
pub fn is_recognised_artifact(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("segmentation")
        || [".nii.gz", ".nrrd", ".json", ".csv"]
            .iter()
            .any(|ext| lower.ends_with(ext))
}

fn is_segmentation(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("segmentation")
        || (lower.contains("seg") && (lower.ends_with(".nii.gz") || lower.ends_with(".nrrd")))
}

/// Recognised artifacts directly inside `output_dir`, segmentations first.
///
/// A missing directory yields an empty list.
pub fn verify_outputs(output_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_recognised_artifact(name) {
            found.push((!is_segmentation(name), entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Zip everything under `src_dir` into `archive_path`, returning the
/// archive size in bytes. Entry names are relative to `src_dir`.
pub fn package_results(src_dir: &Path, archive_path: &Path) -> io::Result<u64> {
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(archive_path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut files = Vec::new();
    collect_files(src_dir, &mut files)?;
    files.sort();

    for path in files {
        let relative = path
            .strip_prefix(src_dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(name, options).map_err(io::Error::other)?;
        let mut input = File::open(&path)?;
        io::copy(&mut input, &mut zip)?;
    }

    let mut writer = zip.finish().map_err(io::Error::other)?;
    io::Write::flush(&mut writer)?;
    drop(writer);
    Ok(fs::metadata(archive_path)?.len())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn recognises_known_result_names() {
        assert!(is_recognised_artifact("knee_seg.nii.gz"));
        assert!(is_recognised_artifact("segmentation_femur.vtk"));
        assert!(is_recognised_artifact("results.json"));
        assert!(is_recognised_artifact("thickness.CSV"));
        assert!(!is_recognised_artifact("pipeline.log"));
        assert!(!is_recognised_artifact("mesh.vtk"));
    }

    #[test]
    fn empty_or_missing_dir_has_no_artifacts() {
        let tmp = TempDir::new().unwrap();
        assert!(verify_outputs(tmp.path()).unwrap().is_empty());
        assert!(verify_outputs(&tmp.path().join("nope")).unwrap().is_empty());

        fs::write(tmp.path().join("pipeline.log"), "ran").unwrap();
        assert!(verify_outputs(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn segmentations_are_listed_first() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a_results.json"), "{}").unwrap();
        fs::write(tmp.path().join("knee_seg.nrrd"), "x").unwrap();
        let found = verify_outputs(tmp.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], tmp.path().join("knee_seg.nrrd"));
    }

    #[test]
    fn packages_nested_outputs() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("pipeline_output");
        fs::create_dir_all(src.join("meshes")).unwrap();
        fs::write(src.join("knee_seg.nii.gz"), b"segmentation").unwrap();
        fs::write(src.join("meshes").join("femur.vtk"), b"mesh").unwrap();

        let archive = tmp.path().join("knee_results.zip");
        let size = package_results(&src, &archive).unwrap();
        assert!(size > 0);
        assert_eq!(size, fs::metadata(&archive).unwrap().len());

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut names: Vec<_> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, ["knee_seg.nii.gz", "meshes/femur.vtk"]);

        let mut body = String::new();
        zip.by_name("meshes/femur.vtk")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "mesh");
    }
}
