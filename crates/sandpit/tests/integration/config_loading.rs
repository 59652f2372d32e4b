use std::path::PathBuf;
use std::time::Duration;

use sandpit::config::{Config, ConfigError};

use super::{FIXTURES_PATH, fixture_spec};

#[test]
fn test_load_valid_config() {
    let path = format!("{FIXTURES_PATH}/configs/valid_full.toml");
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(
        config.docker_socket,
        Some(PathBuf::from("/var/run/docker.sock"))
    );
    assert_eq!(config.workdir, "/exercise");
    assert_eq!(config.limits.memory_mb, 256);
    assert_eq!(config.limits.pids_limit, Some(64));
    assert_eq!(config.pool.warm_capacity, 2);
    assert_eq!(config.pool.max_extension, 4);
    assert_eq!(config.pool.burst_idle_timeout(), Duration::from_secs(10));
    assert_eq!(config.execution.max_attempts, 2);
    assert_eq!(config.execution.retry_backoff(), Duration::from_millis(500));
    assert_eq!(
        config.warmup_dir("golang:1.24"),
        Some(&PathBuf::from("/srv/warmups/go"))
    );
}

#[test]
fn test_load_minimal_config() {
    let path = format!("{FIXTURES_PATH}/configs/valid_minimal.toml");
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(config.pool.warm_capacity, 1);
    assert_eq!(config.pool.max_extension, 10);
    assert_eq!(config.execution.max_attempts, 3);
    assert!(config.warmups.is_empty());
}

#[test]
fn test_load_invalid_zero_attempts() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_zero_attempts.toml");
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_invalid_relative_workdir() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_relative_workdir.toml");
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_exercise_spec() {
    let spec = fixture_spec("shell");

    assert_eq!(spec.image, super::TEST_IMAGE);
    assert_eq!(spec.command, vec!["sh", "test.sh"]);
    assert_eq!(spec.submission_file, "solution.sh");
    assert_eq!(spec.reference_files.len(), 2);
}
