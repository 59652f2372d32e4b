//! Sandbox pools
//!
//! One [`ImagePool`] per image/command pair keeps a warm set of sandboxes
//! ready and extends itself with burst sandboxes under load. The
//! [`PoolRegistry`] creates pools on first use and forgets them once they
//! tear themselves down after going idle.

use std::time::Duration;

use thiserror::Error;

pub use crate::pool::image_pool::{Eviction, ImagePool, PoolStats};
pub use crate::pool::registry::PoolRegistry;
use crate::sandbox::SandboxError;
use crate::types::PoolKey;

mod image_pool;
mod registry;

/// Errors from pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no sandbox became available within {0:?}")]
    Timeout(Duration),

    #[error("pool for {0} is closed")]
    Closed(PoolKey),

    #[error("failed to provision pool for {key}: {source}")]
    Provision {
        key: PoolKey,
        #[source]
        source: SandboxError,
    },
}

impl PoolError {
    /// Check whether retrying the operation may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Provision { .. })
    }
}
