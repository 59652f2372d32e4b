//! Pooled container sandboxes for running untrusted submissions.
//!
//! Sandpit runs learner code against exercise test suites inside disposable
//! Docker containers. Containers are kept warm in per-image pools so that a
//! submission does not pay for container creation, and pools grow under load
//! and shrink back once it passes.
//!
//! # Features
//!
//! - **Warm pools**: A fixed set of ready sandboxes per image and command.
//! - **Burst extension**: Extra sandboxes created under load, bounded by admission slots.
//! - **Idle eviction**: Pools shrink and tear themselves down when unused.
//! - **Warm-up runs**: Per-image files run once in every new sandbox to prime caches.
//! - **Bounded retries**: Infrastructure failures are retried with a backoff.
//! - **Locked-down containers**: No network, no capabilities, memory and CPU caps.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use pool::{ImagePool, PoolError, PoolRegistry, PoolStats};
pub use runner::{RunError, Runner, sanitize};
pub use sandbox::{
    ContainerRuntime, DockerRuntime, RuntimeError, SandboxError, SandboxHandle, SandboxLifecycle,
};
pub use types::{ExecutionResult, ExecutionSpec, ExitStatus, PoolKey, ResourceLimits, SandboxFile};

pub mod config;
pub mod pool;
pub mod runner;
pub mod sandbox;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
