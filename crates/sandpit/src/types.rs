use std::fmt;

use serde::{Deserialize, Serialize};

/// A file placed in the sandbox working directory before a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFile {
    /// File name, relative to the working directory
    pub name: String,

    /// File content
    pub content: String,
}

impl SandboxFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Everything needed to run a submission for one exercise
///
/// Produced by whatever resolves an exercise into runnable data; the core
/// treats it as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Container image reference
    pub image: String,

    /// Command run when the sandbox starts
    pub command: Vec<String>,

    /// Files required to build and test the exercise
    #[serde(default)]
    pub reference_files: Vec<SandboxFile>,

    /// Name of the file the learner payload replaces
    pub submission_file: String,
}

impl ExecutionSpec {
    /// Identity of the pool serving this spec
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.image.clone(), self.command.clone())
    }

    /// Reference files with the submission file replaced by `payload`
    pub fn files_with_payload(&self, payload: &str) -> Vec<SandboxFile> {
        self.reference_files
            .iter()
            .filter(|file| file.name != self.submission_file)
            .cloned()
            .chain(std::iter::once(SandboxFile::new(
                self.submission_file.clone(),
                payload,
            )))
            .collect()
    }
}

/// Identity of an image pool: one image with one command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub image: String,
    pub command: Vec<String>,
}

impl PoolKey {
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.image, self.command.join(" "))
    }
}

/// Resource caps applied to every sandbox container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// CPU quota in microseconds per period
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: i64,

    /// CPU scheduling period in microseconds
    #[serde(default = "default_cpu_period")]
    pub cpu_period: i64,

    /// Maximum number of processes/threads
    #[serde(default)]
    pub pids_limit: Option<i64>,
}

impl ResourceLimits {
    /// 1 megabyte in bytes
    pub const MB: i64 = 1024 * 1024;

    /// Create limits with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory limit in megabytes
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Set the CPU quota and period in microseconds
    pub fn with_cpu(mut self, quota: i64, period: i64) -> Self {
        self.cpu_quota = quota;
        self.cpu_period = period;
        self
    }

    /// Set the maximum number of processes
    pub fn with_pids_limit(mut self, count: i64) -> Self {
        self.pids_limit = Some(count);
        self
    }

    /// Memory limit in bytes, as the container runtime expects it
    pub fn memory_bytes(&self) -> i64 {
        i64::try_from(self.memory_mb)
            .unwrap_or(i64::MAX / Self::MB)
            .saturating_mul(Self::MB)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpu_quota: default_cpu_quota(),
            cpu_period: default_cpu_period(),
            pids_limit: None,
        }
    }
}

fn default_memory_mb() -> u64 {
    512
}

fn default_cpu_quota() -> i64 {
    100_000
}

fn default_cpu_period() -> i64 {
    100_000
}

/// How a sandbox run ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code of the sandbox command
    pub code: i64,

    /// Error reported by the runtime while waiting, if any
    pub error: Option<String>,
}

impl ExitStatus {
    pub fn new(code: i64) -> Self {
        Self { code, error: None }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0 && self.error.is_none()
    }
}

/// Result of running one submission
///
/// A submission whose tests fail is still a successful execution: the
/// failure shows up as a non-zero exit code here, not as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Combined stdout/stderr, restricted to printable ASCII, tab and newline
    pub output: String,

    /// Exit status of the run
    pub status: ExitStatus,
}

impl ExecutionResult {
    /// Check whether the submission exited with code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.success()
    }
}
