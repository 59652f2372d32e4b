//! Tar archives for uploading files into a sandbox
//!
//! Container runtimes accept file uploads as a tar stream extracted at the
//! filesystem root, so every entry is prefixed with the working directory.

use std::time::{SystemTime, UNIX_EPOCH};

use tar::{Builder, Header};

use crate::sandbox::SandboxError;
use crate::types::SandboxFile;

/// Build an archive placing `files` inside `workdir`
///
/// Later entries with the same name overwrite earlier ones on extraction.
/// Names must be relative and must not escape the working directory.
pub fn build_archive(workdir: &str, files: &[SandboxFile]) -> Result<Vec<u8>, SandboxError> {
    let root = workdir.trim_matches('/');
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut builder = Builder::new(Vec::new());
    for file in files {
        let path = entry_path(root, &file.name)?;

        let mut header = Header::new_gnu();
        header.set_size(file.content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        builder
            .append_data(&mut header, &path, file.content.as_bytes())
            .map_err(SandboxError::Archive)?;
    }

    builder.into_inner().map_err(SandboxError::Archive)
}

fn entry_path(root: &str, name: &str) -> Result<String, SandboxError> {
    // Reject path traversal attempts
    if name.is_empty()
        || name.starts_with('/')
        || name.split('/').any(|component| component == "..")
    {
        return Err(SandboxError::InvalidPath(name.to_string()));
    }

    if root.is_empty() {
        Ok(name.to_string())
    } else {
        Ok(format!("{root}/{name}"))
    }
}
