//! Integration tests for sandpit
//!
//! These tests need a reachable Docker daemon and the `alpine:3.20` image.
//! Run with: cargo test -p sandpit --features integration-tests
//!
//! Tests that talk to Docker are marked `#[ignore]`. To include them:
//!    cargo test -p sandpit --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::fs;

use sandpit::config::Config;
use sandpit::types::ExecutionSpec;

mod config_loading;
mod docker_sandbox;
mod submissions;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Image every Docker test runs in
pub(crate) const TEST_IMAGE: &str = "alpine:3.20";

/// Load the execution spec of a fixture exercise
pub(crate) fn fixture_spec(exercise: &str) -> ExecutionSpec {
    let path = format!("{FIXTURES_PATH}/exercises/{exercise}/spec.toml");
    ExecutionSpec::from_file(&path).unwrap_or_else(|e| panic!("Failed to load spec {path}: {e}"))
}

/// Read a submission payload of a fixture exercise
pub(crate) fn fixture_payload(exercise: &str, name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/exercises/{exercise}/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Small, fast-evicting config for tests against a real daemon
pub(crate) fn test_config() -> Config {
    let mut config = Config::empty();
    config.pool.warm_capacity = 2;
    config.pool.max_extension = 2;
    config.pool.margin = 1;
    config.execution.deadline_secs = 20;
    config.execution.retry_backoff_ms = 200;
    config.execution.stop_grace_secs = 1;
    config.limits.pids_limit = Some(64);
    config
}
