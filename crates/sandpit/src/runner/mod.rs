//! Submission runner
//!
//! Ties the pools and the sandbox lifecycle together: a submission is run in
//! a sandbox checked out from the pool of its image, with bounded retries
//! when the infrastructure fails.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{Instrument, debug, info, instrument, warn};

pub use crate::runner::sanitize::{sanitize, sanitize_bytes};

mod sanitize;

use crate::config::Config;
use crate::pool::{ImagePool, PoolError, PoolRegistry, PoolStats};
use crate::sandbox::{ContainerRuntime, DockerRuntime, RuntimeError, SandboxError, SandboxLifecycle};
use crate::types::{ExecutionResult, ExecutionSpec, PoolKey, SandboxFile};

/// Errors that occur while running a submission
#[derive(Debug, Error)]
pub enum RunError {
    #[error("runner is not started")]
    NotInitialized,

    #[error("failed to connect to the container runtime: {0}")]
    Connect(#[source] RuntimeError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("sandbox run failed: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("submission task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RunError {
    /// Check whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotInitialized | Self::Connect(_) | Self::Task(_) => false,
            Self::Pool(err) => err.is_retryable(),
            Self::Sandbox(SandboxError::InvalidPath(_) | SandboxError::Archive(_)) => false,
            Self::Sandbox(_) => true,
        }
    }
}

struct Started {
    lifecycle: Arc<SandboxLifecycle>,
    registry: PoolRegistry,
}

/// Runs submissions in pooled sandboxes
///
/// A runner is created unstarted; [`start`](Self::start) connects it to the
/// container runtime. Until then every operation fails with
/// [`RunError::NotInitialized`].
pub struct Runner {
    config: Config,
    started: OnceCell<Started>,
}

impl Runner {
    /// Create an unstarted runner
    pub fn new(config: Config) -> Self {
        Self {
            config,
            started: OnceCell::new(),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Check whether the runner was started
    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Connect to Docker and start serving submissions
    pub async fn start(&self) -> Result<(), RunError> {
        if self.is_started() {
            return Ok(());
        }
        let docker =
            DockerRuntime::connect(self.config.docker_socket.as_deref()).map_err(RunError::Connect)?;
        self.start_with_runtime(Arc::new(docker)).await
    }

    /// Start serving submissions on the given container runtime
    ///
    /// Starting an already started runner does nothing.
    pub async fn start_with_runtime(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<(), RunError> {
        let execution = &self.config.execution;
        self.started
            .get_or_init(|| async move {
                let lifecycle = Arc::new(
                    SandboxLifecycle::new(runtime, self.config.limits.clone())
                        .workdir(self.config.workdir.clone())
                        .stop_grace(execution.stop_grace())
                        .warmup_deadline(execution.warmup_deadline()),
                );
                let registry = PoolRegistry::new(&self.config, Arc::clone(&lifecycle));
                info!(workdir = %self.config.workdir, "runner started");
                Started {
                    lifecycle,
                    registry,
                }
            })
            .await;
        Ok(())
    }

    /// Run a learner's submission for an exercise
    ///
    /// The payload replaces the exercise's submission file. Failing tests are
    /// not an error: they show up as a non-zero exit status in the result.
    /// Infrastructure failures are retried with a backoff, up to the
    /// configured number of attempts; the last failure is returned.
    #[instrument(skip_all, fields(image = %spec.image))]
    pub async fn run_submission(
        &self,
        spec: &ExecutionSpec,
        payload: &str,
    ) -> Result<ExecutionResult, RunError> {
        let started = self.started()?;
        let key = spec.pool_key();
        let files: Arc<[SandboxFile]> = spec.files_with_payload(payload).into();
        let execution = &self.config.execution;

        let mut attempt = 1;
        loop {
            match self.attempt(started, &key, &files).await {
                Ok(result) => {
                    debug!(attempt, exit_code = result.status.code, "submission finished");
                    return Ok(result);
                }
                Err(err) if !err.is_retryable() || attempt >= execution.max_attempts => {
                    warn!(attempt, error = %err, "submission failed");
                    return Err(err);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "attempt failed, retrying");
                    tokio::time::sleep(execution.retry_backoff()).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        started: &Started,
        key: &PoolKey,
        files: &Arc<[SandboxFile]>,
    ) -> Result<ExecutionResult, RunError> {
        let pool = started.registry.get_or_create(key).await?;

        // A checked-out sandbox must outlive a caller that gives up
        let checkout = tokio::spawn(run_checked_out(
            pool.clone(),
            Arc::clone(&started.lifecycle),
            Arc::clone(files),
            self.config.execution.deadline(),
        )
        .in_current_span());

        match checkout.await? {
            Err(err @ RunError::Pool(PoolError::Closed(_))) => {
                // Went idle between lookup and acquisition
                started.registry.remove(&pool).await;
                Err(err)
            }
            result => result,
        }
    }

    /// Get a snapshot of the pool serving `key`, if there is one
    pub async fn pool_stats(&self, key: &PoolKey) -> Result<Option<PoolStats>, RunError> {
        let Some(pool) = self.started()?.registry.get(key).await else {
            return Ok(None);
        };
        Ok(pool.stats().await)
    }

    /// Destroy every pooled sandbox
    pub async fn shutdown(&self) -> Result<(), RunError> {
        self.started()?.registry.shutdown().await;
        Ok(())
    }

    fn started(&self) -> Result<&Started, RunError> {
        self.started.get().ok_or(RunError::NotInitialized)
    }
}

/// Check out a sandbox, run the files in it and hand it back
async fn run_checked_out(
    pool: ImagePool,
    lifecycle: Arc<SandboxLifecycle>,
    files: Arc<[SandboxFile]>,
    deadline: Duration,
) -> Result<ExecutionResult, RunError> {
    let handle = pool.acquire().await?;
    let id = handle.id().clone();

    match lifecycle.run(handle, &files, deadline).await {
        Ok((handle, output)) => {
            pool.release(handle);
            Ok(ExecutionResult {
                output: sanitize_bytes(&output.output),
                status: output.status,
            })
        }
        Err(err) => {
            pool.discard(id);
            Err(err.into())
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish()
    }
}
