use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::types::ResourceLimits;

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../sandpit.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for Sandpit
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Docker daemon socket (uses the local defaults if not specified).
    #[serde(default)]
    pub docker_socket: Option<PathBuf>,

    /// Working directory inside every sandbox; submission files land here.
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Resource caps applied to every sandbox container
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Sizing and idle-eviction policy of the per-image pools
    #[serde(default)]
    pub pool: PoolConfig,

    /// Deadlines and retry policy of submission runs
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Warm-up runs primed into every new sandbox of an image
    #[serde(default)]
    pub warmups: Vec<WarmupConfig>,
}

/// Pool sizing and idle-eviction policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of always-ready sandboxes per image
    pub warm_capacity: usize,

    /// Maximum number of extra sandboxes created under load
    pub max_extension: usize,

    /// Free sandboxes kept in reserve; dropping below this triggers an extension
    pub margin: usize,

    /// How long an acquirer waits for a sandbox before giving up
    pub acquire_timeout_secs: u64,

    /// Idle time after which a whole pool is torn down
    pub idle_timeout_secs: u64,

    /// Idle time after which the burst sandboxes are destroyed
    pub burst_idle_timeout_secs: u64,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn burst_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.burst_idle_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm_capacity: 3,
            max_extension: 10,
            margin: 2,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 180,
            burst_idle_timeout_secs: 15,
        }
    }
}

/// Deadlines and retry policy for submission runs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Deadline for one run, upload to log collection
    pub deadline_secs: u64,

    /// Acquire/run attempts per submission
    pub max_attempts: u32,

    /// Pause between attempts
    pub retry_backoff_ms: u64,

    /// Grace period given to a sandbox before it is killed on destroy
    pub stop_grace_secs: u64,

    /// Deadline for the warm-up run of a new sandbox
    pub warmup_deadline_secs: u64,
}

impl ExecutionConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn warmup_deadline(&self) -> Duration {
        Duration::from_secs(self.warmup_deadline_secs)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 30,
            max_attempts: 3,
            retry_backoff_ms: 3000,
            stop_grace_secs: 10,
            warmup_deadline_secs: 120,
        }
    }
}

/// Files run once in every new sandbox of `image` to prime its caches
#[derive(Debug, Clone, Deserialize)]
pub struct WarmupConfig {
    /// Image the warm-up applies to
    pub image: String,

    /// Host directory whose files are uploaded for the warm-up run
    pub directory: PathBuf,
}

impl Config {
    /// Create a new config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config with built-in defaults and no warm-ups
    pub fn empty() -> Self {
        Self {
            docker_socket: None,
            workdir: default_workdir(),
            limits: ResourceLimits::default(),
            pool: PoolConfig::default(),
            execution: ExecutionConfig::default(),
            warmups: Vec::new(),
        }
    }

    /// Get the warm-up directory configured for an image
    pub fn warmup_dir(&self, image: &str) -> Option<&PathBuf> {
        self.warmups
            .iter()
            .find(|warmup| warmup.image == image)
            .map(|warmup| &warmup.directory)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_workdir() -> String {
    "/workspace".to_string()
}
