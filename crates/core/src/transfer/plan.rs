//! Turning dropped local paths and selected keys into transfer requests

use std::path::Path;

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::listing::parent_prefix;
use crate::traits::ObjectInfo;

use super::item::TransferRequest;

/// Requests derived from one local file or folder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPlan {
    pub requests: Vec<TransferRequest>,
    pub total_bytes: u64,
    /// More files than the large-folder threshold; ask before enqueueing
    pub needs_confirmation: bool,
}

impl UploadPlan {
    pub fn file_count(&self) -> usize {
        self.requests.len()
    }
}

/// Plan the upload of `path` into `bucket` under `prefix`.
///
/// A file maps to `prefix + file_name`. A folder maps every file below it
/// to `prefix + folder_name + "/" + relative_path`, using `/` separators
/// whatever the platform.
pub fn plan_upload(
    path: &Path,
    bucket: &str,
    prefix: &str,
    large_folder_threshold: usize,
) -> Result<UploadPlan> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| Error::InvalidPath(format!("{}: {e}", path.display())))?;
    let name = file_name(path)?;

    let mut plan = UploadPlan::default();

    if metadata.is_file() {
        plan.total_bytes = metadata.len();
        plan.requests
            .push(TransferRequest::upload(path, bucket, format!("{prefix}{name}")));
        return Ok(plan);
    }

    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(path)
            .map_err(|_| Error::InvalidPath(entry.path().display().to_string()))?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        plan.total_bytes += entry.metadata().map_err(std::io::Error::from)?.len();
        plan.requests.push(TransferRequest::upload(
            entry.path(),
            bucket,
            format!("{prefix}{name}/{relative}"),
        ));
    }

    plan.needs_confirmation = plan.requests.len() > large_folder_threshold;

    tracing::debug!(
        path = %path.display(),
        files = plan.requests.len(),
        bytes = plan.total_bytes,
        needs_confirmation = plan.needs_confirmation,
        "Planned folder upload"
    );

    Ok(plan)
}

/// Download requests for `keys`, each saved under `dest_dir` by its last
/// path segment
pub fn plan_download(
    bucket: &str,
    keys: &[String],
    dest_dir: &Path,
    delimiter: &str,
) -> Result<Vec<TransferRequest>> {
    keys.iter()
        .map(|key| {
            let name = key
                .rsplit(delimiter)
                .find(|segment| !segment.is_empty())
                .filter(|name| *name != "." && *name != "..")
                .ok_or_else(|| Error::InvalidPath(format!("No file name in key: {key}")))?;
            Ok(TransferRequest::download(
                bucket,
                key.as_str(),
                dest_dir.join(name),
            ))
        })
        .collect()
}

/// Download requests recreating `folder` under `dest_dir`.
///
/// `objects` are the files found below `folder`. Each one lands at
/// `dest_dir/<folder name>/<relative path>`, one directory per delimited
/// segment. Keys with `.` or `..` segments are rejected.
pub fn plan_folder_download(
    bucket: &str,
    folder: &str,
    objects: &[ObjectInfo],
    dest_dir: &Path,
    delimiter: &str,
) -> Result<Vec<TransferRequest>> {
    let base = parent_prefix(folder, delimiter);

    objects
        .iter()
        .map(|object| {
            let relative = object.key.strip_prefix(base.as_str()).ok_or_else(|| {
                Error::InvalidPath(format!("Key outside {folder}: {}", object.key))
            })?;

            let mut local = dest_dir.to_path_buf();
            for segment in relative.split(delimiter).filter(|s| !s.is_empty()) {
                if segment == "." || segment == ".." {
                    return Err(Error::InvalidPath(format!(
                        "Unsafe segment in key: {}",
                        object.key
                    )));
                }
                local.push(segment);
            }
            Ok(TransferRequest::download(bucket, object.key.as_str(), local))
        })
        .collect()
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidPath(format!("No file name in path: {}", path.display())))
}
