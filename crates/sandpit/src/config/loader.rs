//! Configuration file loading for Sandpit
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError};
use crate::types::ExecutionSpec;

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.warm_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pool.warm_capacity must be at least 1".to_string(),
            ));
        }
        if self.execution.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.execution.deadline_secs == 0 {
            return Err(ConfigError::Invalid(
                "execution.deadline_secs must be at least 1".to_string(),
            ));
        }
        if !self.workdir.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "workdir '{}' must be an absolute path",
                self.workdir
            )));
        }
        if self.limits.memory_mb == 0 {
            return Err(ConfigError::Invalid(
                "limits.memory_mb must be at least 1".to_string(),
            ));
        }

        for warmup in &self.warmups {
            if warmup.image.is_empty() {
                return Err(ConfigError::Invalid(
                    "warm-up entry has empty image".to_string(),
                ));
            }
            if warmup.directory.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "warm-up for '{}' has empty directory",
                    warmup.image
                )));
            }
        }

        Ok(())
    }
}

impl ExecutionSpec {
    /// Load an execution spec from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let spec: ExecutionSpec = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse an execution spec from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let spec: ExecutionSpec = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.image.is_empty() {
            return Err(ConfigError::Invalid("image must not be empty".to_string()));
        }
        if self.command.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "command for '{}' must not be empty",
                self.image
            )));
        }
        if self.submission_file.is_empty() {
            return Err(ConfigError::Invalid(
                "submission_file must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
