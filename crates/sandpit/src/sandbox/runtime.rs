//! Container runtime control plane
//!
//! The lifecycle layer only needs a handful of primitives from the runtime;
//! they are collected in [`ContainerRuntime`] so the pool can be driven by
//! Docker in production and by an in-memory fake in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ExitStatus, ResourceLimits};

/// Opaque identifier of a runtime-level sandbox instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated id for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map_or(self.0.len(), |(idx, _)| idx);
        &self.0[..end]
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors reported by the container runtime
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("sandbox {0} not found")]
    NotFound(String),

    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} stream ended unexpectedly")]
    StreamEnded { operation: &'static str },
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Parameters of a new sandbox instance
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub image: String,
    pub command: Vec<String>,
    pub workdir: String,
    pub limits: ResourceLimits,
}

/// Primitives the sandbox lifecycle needs from a container runtime
///
/// Implementations must be cheap to share across tasks; every call may be
/// issued concurrently for different instances.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Provision a stopped instance
    async fn create(&self, request: &CreateRequest) -> Result<SandboxId, RuntimeError>;

    /// Extract a tar archive at the filesystem root of the instance
    async fn copy_files_in(&self, id: &SandboxId, archive: Vec<u8>) -> Result<(), RuntimeError>;

    /// Start the instance's command
    async fn start(&self, id: &SandboxId) -> Result<(), RuntimeError>;

    /// Wait until the instance is no longer running
    async fn wait_until_not_running(&self, id: &SandboxId) -> Result<ExitStatus, RuntimeError>;

    /// Everything written to stdout/stderr since `since` (unix seconds)
    async fn logs_since(&self, id: &SandboxId, since: i64) -> Result<Vec<u8>, RuntimeError>;

    /// Stop the instance, killing it after `grace`
    async fn stop(&self, id: &SandboxId, grace: Duration) -> Result<(), RuntimeError>;

    /// Remove the instance and its filesystem
    async fn remove(&self, id: &SandboxId) -> Result<(), RuntimeError>;
}
