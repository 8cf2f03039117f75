use std::path::Path;
use tracing::{debug, info};

use crate::{
    error::{DetectError, DetectResult},
    io::{is_hidden, write_atomic},
    normalize::ImageKind,
    workspace::Workspaces,
};

/// One file from an upload request, fully buffered.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self { filename: filename.into(), bytes: bytes.into() }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub skipped: usize,
}

/// Write every allowed file into `user_key`'s workspace.
///
/// Disallowed extensions and unusable names are only counted. The workspace
/// is created on the first accepted file, so an all-skipped batch leaves no
/// trace on disk.
pub async fn ingest(workspaces: &Workspaces, user_key: &str, files: &[UploadedFile]) -> DetectResult<IngestReport> {
    let dir = workspaces.dir_for(user_key);
    let mut report = IngestReport::default();
    let mut dir_ready = false;

    for file in files {
        let Some(name) = stored_name(&file.filename) else {
            debug!(user_key, filename = %file.filename, "skipping unusable filename");
            report.skipped += 1;
            continue;
        };
        if ImageKind::from_name(name).is_none() {
            debug!(user_key, filename = name, "skipping disallowed extension");
            report.skipped += 1;
            continue;
        }

        if !dir_ready {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| DetectError::workspace(&dir, e))?;
            dir_ready = true;
        }
        let path = dir.join(name);
        write_atomic(&path, &file.bytes).await.map_err(|e| DetectError::workspace(&path, e))?;
        report.accepted += 1;
    }

    info!(user_key, accepted = report.accepted, skipped = report.skipped, "ingested upload");
    Ok(report)
}

/// Final path component of a client-supplied filename, if it is usable as a
/// plain file name inside the workspace.
fn stored_name(filename: &str) -> Option<&str> {
    // clients on Windows may send full paths with backslashes
    let last = filename.rsplit(['/', '\\']).next()?;
    let name = Path::new(last).file_name()?.to_str()?;
    if name.is_empty() || is_hidden(name) || name.contains('\0') {
        return None;
    }
    Some(name)
}
