//! Disposable container sandboxes
//!
//! This module provides the low-level sandbox operations: the container
//! runtime abstraction and its Docker backend, the lifecycle of single
//! instances (create, run, destroy), and the idle timer used by the pools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

pub use crate::sandbox::archive::build_archive;
pub use crate::sandbox::docker::DockerRuntime;
pub use crate::sandbox::lifecycle::{RunOutput, SandboxHandle, SandboxLifecycle};
pub use crate::sandbox::runtime::{ContainerRuntime, CreateRequest, RuntimeError, SandboxId};
pub use crate::sandbox::timer::IdleTimer;
use crate::types::SandboxFile;

mod archive;
mod docker;
mod lifecycle;
mod runtime;
mod timer;

/// Errors that occur while creating or running a sandbox
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container runtime error: {0}")]
    Runtime(#[source] RuntimeError),

    #[error("failed to build file archive: {0}")]
    Archive(#[source] std::io::Error),

    #[error("invalid file name: {0:?}")]
    InvalidPath(String),

    #[error("run did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("warm-up run failed: {0}")]
    Warmup(#[source] Box<SandboxError>),

    #[error("failed to load warm-up files from {path}: {source}")]
    WarmupLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load the files of a warm-up directory
///
/// Only regular files at the top level are used; entries are sorted by name
/// so every sandbox of an image sees the same archive.
pub async fn load_warmup(dir: &Path) -> Result<Vec<SandboxFile>, SandboxError> {
    let load_err = |source| SandboxError::WarmupLoad {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(load_err)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(load_err)? {
        if !entry.file_type().await.map_err(load_err)?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let content = tokio::fs::read_to_string(entry.path())
            .await
            .map_err(load_err)?;
        files.push(SandboxFile::new(name, content));
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(?dir, count = files.len(), "loaded warm-up files");
    Ok(files)
}
