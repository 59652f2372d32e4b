use std::sync::Arc;

use sandpit::config::WarmupConfig;
use sandpit::runner::Runner;

use super::{FIXTURES_PATH, TEST_IMAGE, fixture_payload, fixture_spec, test_config};

async fn started_runner(config: sandpit::Config) -> Arc<Runner> {
    let runner = Runner::new(config);
    runner.start().await.expect("Failed to start runner");
    Arc::new(runner)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_correct_submission_passes() {
    let runner = started_runner(test_config()).await;
    let spec = fixture_spec("shell");

    let result = runner
        .run_submission(&spec, &fixture_payload("shell", "correct.sh"))
        .await
        .expect("Submission failed");

    assert!(result.is_success(), "output: {}", result.output);
    assert!(result.output.contains("PASS add"));

    runner.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_wrong_submission_reports_failure() {
    let runner = started_runner(test_config()).await;
    let spec = fixture_spec("shell");

    let result = runner
        .run_submission(&spec, &fixture_payload("shell", "wrong.sh"))
        .await
        .expect("A failing test suite is not an infrastructure error");

    assert_eq!(result.status.code, 1);
    assert!(result.output.contains("FAIL add: got -1, want 5"));

    runner.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_concurrent_submissions_beyond_warm_capacity() {
    let runner = started_runner(test_config()).await;
    let spec = Arc::new(fixture_spec("shell"));
    let payload = Arc::new(fixture_payload("shell", "correct.sh"));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let runner = Arc::clone(&runner);
        let spec = Arc::clone(&spec);
        let payload = Arc::clone(&payload);
        tasks.push(tokio::spawn(async move {
            runner.run_submission(&spec, &payload).await
        }));
    }

    for task in tasks {
        let result = task.await.unwrap().expect("Submission failed");
        assert!(result.is_success(), "output: {}", result.output);
    }

    let stats = runner
        .pool_stats(&spec.pool_key())
        .await
        .unwrap()
        .expect("Pool should exist");
    assert_eq!(stats.checked_out, 0);
    assert!(stats.warm + stats.burst <= 4);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_warmup_directory_is_used() {
    let mut config = test_config();
    config.warmups.push(WarmupConfig {
        image: TEST_IMAGE.to_string(),
        directory: format!("{FIXTURES_PATH}/warmups/alpine").into(),
    });
    let runner = started_runner(config).await;
    let spec = fixture_spec("shell");

    let result = runner
        .run_submission(&spec, &fixture_payload("shell", "correct.sh"))
        .await
        .expect("Submission failed");

    assert!(result.is_success(), "output: {}", result.output);
    assert!(result.output.contains("PASS add"));

    runner.shutdown().await.unwrap();
}
