//! Sandbox lifecycle management
//!
//! Creation, runs, and destruction of individual sandbox instances on top of
//! a [`ContainerRuntime`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument, warn};

use crate::sandbox::SandboxError;
use crate::sandbox::archive::build_archive;
use crate::sandbox::runtime::{ContainerRuntime, CreateRequest, SandboxId};
use crate::types::{ExitStatus, PoolKey, ResourceLimits, SandboxFile};

/// A live sandbox instance
///
/// Exactly one owner holds a handle at any time: a pool queue, or the
/// execution that checked it out. Handles are consumed by
/// [`SandboxLifecycle::destroy`], and a failed [`SandboxLifecycle::run`]
/// consumes the handle it was given.
///
/// Dropping a handle without destroying it leaks the instance; the `Drop`
/// implementation logs a warning when that happens.
#[derive(Debug)]
pub struct SandboxHandle {
    id: SandboxId,
    live: bool,
}

impl SandboxHandle {
    pub(crate) fn new(id: SandboxId) -> Self {
        Self { id, live: true }
    }

    /// Get the instance id
    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    fn into_id(mut self) -> SandboxId {
        self.live = false;
        std::mem::replace(&mut self.id, SandboxId::new(String::new()))
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.live {
            warn!(
                sandbox = %self.id,
                "SandboxHandle dropped without being destroyed or returned to its pool; \
                 the instance is leaked"
            );
        }
    }
}

/// Captured output of a completed run
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Raw combined stdout/stderr bytes
    pub output: Vec<u8>,

    /// Exit status of the sandbox command
    pub status: ExitStatus,
}

/// Low-level operations on sandbox instances
pub struct SandboxLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    limits: ResourceLimits,
    workdir: String,
    stop_grace: Duration,
    warmup_deadline: Duration,
}

impl std::fmt::Debug for SandboxLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLifecycle")
            .field("limits", &self.limits)
            .field("workdir", &self.workdir)
            .field("stop_grace", &self.stop_grace)
            .field("warmup_deadline", &self.warmup_deadline)
            .finish_non_exhaustive()
    }
}

impl SandboxLifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, limits: ResourceLimits) -> Self {
        Self {
            runtime,
            limits,
            workdir: "/workspace".to_string(),
            stop_grace: Duration::from_secs(10),
            warmup_deadline: Duration::from_secs(120),
        }
    }

    /// Set the working directory files are uploaded into
    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Set the grace period given to a sandbox before it is killed
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the deadline of warm-up runs
    pub fn warmup_deadline(mut self, deadline: Duration) -> Self {
        self.warmup_deadline = deadline;
        self
    }

    /// Create a new stopped sandbox, warmed up if `warmup` is given
    ///
    /// The returned handle is only produced once the warm-up succeeded; a
    /// failed warm-up destroys the instance.
    #[instrument(skip(self, warmup), fields(key = %key))]
    pub async fn create(
        &self,
        key: &PoolKey,
        warmup: Option<&[SandboxFile]>,
    ) -> Result<SandboxHandle, SandboxError> {
        let request = CreateRequest {
            image: key.image.clone(),
            command: key.command.clone(),
            workdir: self.workdir.clone(),
            limits: self.limits.clone(),
        };

        let id = self
            .runtime
            .create(&request)
            .await
            .map_err(SandboxError::Runtime)?;
        debug!(sandbox = id.short(), "sandbox created");
        let handle = SandboxHandle::new(id);

        let Some(files) = warmup else {
            return Ok(handle);
        };

        match self.run(handle, files, self.warmup_deadline).await {
            Ok((handle, output)) => {
                debug!(
                    sandbox = handle.id().short(),
                    exit_code = output.status.code,
                    "sandbox warmed up"
                );
                Ok(handle)
            }
            Err(err) => Err(SandboxError::Warmup(Box::new(err))),
        }
    }

    /// Run `files` in a sandbox and collect its output
    ///
    /// Uploads the files into the working directory, starts the sandbox and
    /// waits for it to stop, then collects the logs written since the start.
    /// All of it must finish within `deadline`.
    ///
    /// On success the handle is handed back. On any failure the sandbox is
    /// destroyed before the error is returned, since its state is unknown.
    #[instrument(skip(self, handle, files), fields(sandbox = handle.id().short()))]
    pub async fn run(
        &self,
        handle: SandboxHandle,
        files: &[SandboxFile],
        deadline: Duration,
    ) -> Result<(SandboxHandle, RunOutput), SandboxError> {
        let result = match tokio::time::timeout(deadline, self.try_run(&handle, files)).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::DeadlineExceeded(deadline)),
        };

        match result {
            Ok(output) => Ok((handle, output)),
            Err(err) => {
                warn!(error = %err, "run failed, destroying sandbox");
                self.destroy(handle).await;
                Err(err)
            }
        }
    }

    async fn try_run(
        &self,
        handle: &SandboxHandle,
        files: &[SandboxFile],
    ) -> Result<RunOutput, SandboxError> {
        let id = handle.id();
        let archive = build_archive(&self.workdir, files)?;

        self.runtime
            .copy_files_in(id, archive)
            .await
            .map_err(SandboxError::Runtime)?;
        debug!(count = files.len(), "copied files into sandbox");

        let started_at = unix_now();
        self.runtime
            .start(id)
            .await
            .map_err(SandboxError::Runtime)?;

        let status = self
            .runtime
            .wait_until_not_running(id)
            .await
            .map_err(SandboxError::Runtime)?;

        let output = self
            .runtime
            .logs_since(id, started_at)
            .await
            .map_err(SandboxError::Runtime)?;

        debug!(
            exit_code = status.code,
            len = output.len(),
            "run complete"
        );

        Ok(RunOutput { output, status })
    }

    /// Stop and remove a sandbox
    ///
    /// Never fails: an instance that is already gone is fine, and any other
    /// runtime error is logged and the sequence continues.
    #[instrument(skip(self, handle), fields(sandbox = handle.id().short()))]
    pub async fn destroy(&self, handle: SandboxHandle) {
        let id = handle.into_id();

        if let Err(err) = self.runtime.stop(&id, self.stop_grace).await
            && !err.is_not_found()
        {
            warn!(error = %err, "failed to stop sandbox");
        }

        match self.runtime.remove(&id).await {
            Ok(()) => debug!("sandbox destroyed"),
            Err(err) if err.is_not_found() => debug!("sandbox already gone"),
            Err(err) => warn!(error = %err, "failed to remove sandbox"),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
