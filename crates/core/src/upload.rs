//! Upload validation and preparation.
//!
//! [`prepare_upload`] turns whatever the client sent into the path the
//! pipeline should read: the file itself, an image extracted from a zip, or
//! a directory holding a DICOM series. Everything here is blocking file I/O;
//! async callers run it on `spawn_blocking`.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Extensions accepted at upload time.
pub const ALLOWED_EXTENSIONS: [&str; 5] = [".dcm", ".nii", ".nii.gz", ".nrrd", ".zip"];

/// Minimum number of slices for a directory to count as a DICOM series.
pub const MIN_DICOM_SLICES: usize = 10;

/// Minimum extent of each spatial dimension in an uncompressed NIfTI volume.
const MIN_DIM_EXTENT: i16 = 10;

/// `sizeof_hdr` values of NIfTI-1 and NIfTI-2 headers.
const NIFTI1_HEADER_SIZE: i32 = 348;
const NIFTI2_HEADER_SIZE: i32 = 540;

/// Byte offset of the `dim[8]` array in a NIfTI-1 header.
const NIFTI1_DIM_OFFSET: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid file extension '{0}'. Accepted formats: .dcm, .nii, .nii.gz, .nrrd, .zip")]
    UnsupportedExtension(String),

    #[error("Uploaded file is empty")]
    Empty,

    #[error("Invalid or corrupted zip file")]
    BadArchive,

    #[error(
        "No valid medical image found in zip file. \
         Expected: .nii, .nii.gz, .nrrd, or DICOM series folder"
    )]
    NoImageFound,

    #[error("{0}")]
    InvalidImage(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl UploadError {
    /// Whether the client caused the failure (as opposed to the server's disk).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Lower-cased accepted extension of `filename`, treating `.nii.gz` as one.
pub fn detect_extension(filename: &str) -> Option<&'static str> {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".nii.gz") {
        return Some(".nii.gz");
    }
    ALLOWED_EXTENSIONS
        .into_iter()
        .find(|ext| *ext != ".nii.gz" && lower.ends_with(ext))
}

/// File name with the image extension removed (`knee.nii.gz` -> `knee`).
pub fn file_stem(filename: &str) -> &str {
    let base = filename.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(filename);
    match detect_extension(base) {
        Some(ext) if base.len() > ext.len() => &base[..base.len() - ext.len()],
        _ => base,
    }
}

/// Validate `upload_path` and return the image the pipeline should read.
///
/// Zip archives are extracted into `scratch_dir`. On error nothing is
/// cleaned up here; the caller owns both paths.
pub fn prepare_upload(upload_path: &Path, scratch_dir: &Path) -> Result<PathBuf, UploadError> {
    let name = upload_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let ext = detect_extension(name).ok_or_else(|| {
        let suffix = name.rfind('.').map(|i| &name[i..]).unwrap_or_default();
        UploadError::UnsupportedExtension(suffix.to_ascii_lowercase())
    })?;

    if fs::metadata(upload_path)?.len() == 0 {
        return Err(UploadError::Empty);
    }

    if ext == ".zip" {
        fs::create_dir_all(scratch_dir)?;
        extract_zip(upload_path, scratch_dir)?;
        let found = find_medical_image(scratch_dir)?.ok_or(UploadError::NoImageFound)?;
        if found.is_file() {
            sanity_check(&found)?;
        }
        Ok(found)
    } else {
        sanity_check(upload_path)?;
        Ok(upload_path.to_path_buf())
    }
}

// ---------------------------------------------------------------------------
// Zip extraction
// ---------------------------------------------------------------------------

fn extract_zip(zip_path: &Path, dest: &Path) -> Result<(), UploadError> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|_| UploadError::BadArchive)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|_| UploadError::BadArchive)?;
        // Entries escaping the destination are skipped.
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(entry = entry.name(), "Skipping unsafe zip entry");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Search `root` for the image to process.
///
/// Order: NIfTI (`.nii.gz` before `.nii`), NRRD, a directory with at least
/// [`MIN_DICOM_SLICES`] `.dcm` files, a single `.dcm`. Within each group the
/// lexicographically first path wins.
pub fn find_medical_image(root: &Path) -> io::Result<Option<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    walk(root, &mut files, &mut dirs)?;
    files.sort();
    dirs.sort();

    let with_ext = |ext: &str| {
        files
            .iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(detect_extension)
                    == Some(ext)
            })
            .cloned()
    };

    for ext in [".nii.gz", ".nii", ".nrrd"] {
        if let Some(found) = with_ext(ext) {
            return Ok(Some(found));
        }
    }

    for dir in std::iter::once(root.to_path_buf()).chain(dirs) {
        if count_dicom_files(&dir)? >= MIN_DICOM_SLICES {
            return Ok(Some(dir));
        }
    }

    Ok(with_ext(".dcm"))
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>, dirs: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            dirs.push(path.clone());
            walk(&path, files, dirs)?;
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

fn count_dicom_files(dir: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_dcm = entry.file_type()?.is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.to_ascii_lowercase().ends_with(".dcm"));
        if is_dcm {
            count += 1;
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Sanity checks
// ---------------------------------------------------------------------------

/// Cheap structural check before a job is created.
///
/// Only uncompressed NIfTI is inspected; deeper decoding is left to the
/// pipeline.
fn sanity_check(path: &Path) -> Result<(), UploadError> {
    if fs::metadata(path)?.len() == 0 {
        return Err(UploadError::Empty);
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if detect_extension(name) == Some(".nii") {
        check_nifti_header(path)?;
    }
    Ok(())
}

fn check_nifti_header(path: &Path) -> Result<(), UploadError> {
    let mut header = [0u8; NIFTI1_DIM_OFFSET + 16];
    let mut file = File::open(path)?;
    if let Err(e) = file.read_exact(&mut header) {
        return match e.kind() {
            io::ErrorKind::UnexpectedEof => Err(UploadError::InvalidImage(
                "Failed to read medical image: file is too short for a NIfTI header".into(),
            )),
            _ => Err(e.into()),
        };
    }

    let size_bytes = [header[0], header[1], header[2], header[3]];
    let (size, little_endian) = match i32::from_le_bytes(size_bytes) {
        NIFTI1_HEADER_SIZE => (NIFTI1_HEADER_SIZE, true),
        NIFTI2_HEADER_SIZE => (NIFTI2_HEADER_SIZE, true),
        _ => match i32::from_be_bytes(size_bytes) {
            NIFTI1_HEADER_SIZE => (NIFTI1_HEADER_SIZE, false),
            NIFTI2_HEADER_SIZE => (NIFTI2_HEADER_SIZE, false),
            _ => {
                return Err(UploadError::InvalidImage(
                    "Failed to read medical image: not a valid NIfTI file".into(),
                ))
            }
        },
    };
    if size == NIFTI2_HEADER_SIZE {
        return Ok(());
    }

    let dim = |i: usize| {
        let at = NIFTI1_DIM_OFFSET + 2 * i;
        let bytes = [header[at], header[at + 1]];
        if little_endian {
            i16::from_le_bytes(bytes)
        } else {
            i16::from_be_bytes(bytes)
        }
    };

    let ndim = dim(0);
    if ndim < 3 {
        return Err(UploadError::InvalidImage(format!(
            "Image is {ndim}D, expected 3D volume. Please upload a 3D MRI scan."
        )));
    }
    let extents = [dim(1), dim(2), dim(3)];
    if extents.iter().any(|&d| d < MIN_DIM_EXTENT) {
        return Err(UploadError::InvalidImage(format!(
            "Image dimensions too small: {extents:?}. Expected a full 3D MRI volume."
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
