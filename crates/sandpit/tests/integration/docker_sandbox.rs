use std::sync::Arc;
use std::time::Duration;

use sandpit::sandbox::{DockerRuntime, SandboxError, SandboxLifecycle};
use sandpit::types::{PoolKey, ResourceLimits, SandboxFile};

use super::TEST_IMAGE;

fn lifecycle() -> SandboxLifecycle {
    let runtime = DockerRuntime::connect_local().expect("Failed to connect to Docker");
    SandboxLifecycle::new(Arc::new(runtime), ResourceLimits::new().with_pids_limit(64))
        .stop_grace(Duration::from_secs(1))
}

fn script_key() -> PoolKey {
    PoolKey::new(TEST_IMAGE, vec!["sh".to_string(), "main.sh".to_string()])
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_run_collects_output() {
    let lifecycle = lifecycle();
    let handle = lifecycle
        .create(&script_key(), None)
        .await
        .expect("Failed to create sandbox");

    let files = vec![SandboxFile::new("main.sh", "echo hello; echo oops >&2")];
    let (handle, output) = lifecycle
        .run(handle, &files, Duration::from_secs(20))
        .await
        .expect("Run failed");

    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.output);
    assert!(text.contains("hello"));
    assert!(text.contains("oops"));

    lifecycle.destroy(handle).await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_sandbox_is_reusable() {
    let lifecycle = lifecycle();
    let handle = lifecycle
        .create(&script_key(), None)
        .await
        .expect("Failed to create sandbox");

    let first = vec![SandboxFile::new("main.sh", "echo first")];
    let (handle, output) = lifecycle
        .run(handle, &first, Duration::from_secs(20))
        .await
        .expect("First run failed");
    assert!(String::from_utf8_lossy(&output.output).contains("first"));

    // Logs of the earlier run are not returned again
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = vec![SandboxFile::new("main.sh", "echo second")];
    let (handle, output) = lifecycle
        .run(handle, &second, Duration::from_secs(20))
        .await
        .expect("Second run failed");
    let text = String::from_utf8_lossy(&output.output);
    assert!(text.contains("second"));
    assert!(!text.contains("first"));

    lifecycle.destroy(handle).await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_non_zero_exit_is_reported() {
    let lifecycle = lifecycle();
    let handle = lifecycle
        .create(&script_key(), None)
        .await
        .expect("Failed to create sandbox");

    let files = vec![SandboxFile::new("main.sh", "exit 3")];
    let (handle, output) = lifecycle
        .run(handle, &files, Duration::from_secs(20))
        .await
        .expect("Run failed");

    assert_eq!(output.status.code, 3);
    lifecycle.destroy(handle).await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_network_is_disabled() {
    let lifecycle = lifecycle();
    let handle = lifecycle
        .create(&script_key(), None)
        .await
        .expect("Failed to create sandbox");

    let files = vec![SandboxFile::new(
        "main.sh",
        "wget -q -T 2 -O /dev/null http://example.com && echo reachable || echo unreachable",
    )];
    let (handle, output) = lifecycle
        .run(handle, &files, Duration::from_secs(20))
        .await
        .expect("Run failed");

    assert!(String::from_utf8_lossy(&output.output).contains("unreachable"));
    lifecycle.destroy(handle).await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_deadline_destroys_sandbox() {
    let lifecycle = lifecycle();
    let handle = lifecycle
        .create(&script_key(), None)
        .await
        .expect("Failed to create sandbox");

    let files = vec![SandboxFile::new("main.sh", "sleep 30")];
    let result = lifecycle.run(handle, &files, Duration::from_secs(2)).await;

    assert!(matches!(result, Err(SandboxError::DeadlineExceeded(_))));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_missing_image_fails_create() {
    let lifecycle = lifecycle();
    let key = PoolKey::new("sandpit-test/does-not-exist:0", vec!["true".to_string()]);

    let result = lifecycle.create(&key, None).await;
    assert!(matches!(result, Err(SandboxError::Runtime(_))));
}
