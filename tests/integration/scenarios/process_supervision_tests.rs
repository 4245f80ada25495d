use crate::integration::{init_tracing, test_config, FakeExamples};
use anyhow::Result;
use example_harness::{HarnessError, ManagedProcess, PortAllocator, ProcessRegistry, ProcessState};
use std::time::{Duration, Instant};

/// A process that outlives its wait is killed and reported with its output
#[tokio::test]
async fn test_still_running_is_killed() -> Result<()> {
    init_tracing();

    let config = test_config();
    let mut processes = ProcessRegistry::new(config.launch_options());
    let sleeper = processes.start(["sh", "-c", "echo 'about to hang'; exec sleep 30"])?;

    let started = Instant::now();
    let err = sleeper.wait_out(Duration::from_millis(300)).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));

    match err {
        HarnessError::StillRunning { ref output, .. } => assert_eq!(output.0, "about to hang\n"),
        ref other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("still running after 300ms"));

    processes.teardown();
    Ok(())
}

/// Waiting for a broker's readiness marker, then for a listener on its port
#[tokio::test]
async fn test_broker_readiness() -> Result<()> {
    init_tracing();

    let fake = FakeExamples::new()?;
    let config = test_config();
    let mut processes = ProcessRegistry::new(config.launch_options());

    let mut argv = fake.examples().broker.clone();
    argv.extend(["-a".to_string(), "127.0.0.1:5672/examples".to_string()]);
    let broker = processes.start(argv)?;

    let found = broker
        .wait_for_pattern(r"listening on ([0-9.]+):(\d+)", Duration::from_secs(10))
        .await?;
    assert_eq!(found.group(1), Some("127.0.0.1"));
    assert_eq!(found.group(2), Some("5672"));
    assert!(broker.is_running());

    processes.teardown();
    Ok(())
}

/// Nothing ever listens on a released port, so the listener wait gives up
#[tokio::test]
async fn test_listener_wait_times_out() -> Result<()> {
    init_tracing();

    let allocator = PortAllocator::new("127.0.0.1".parse()?);
    let port = allocator.free_port()?;
    let addr = format!("127.0.0.1:{}", port).parse()?;

    let err = PortAllocator::wait_for_listener(addr, Duration::from_millis(300), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::RetryTimeout { .. }), "{}", err);
    Ok(())
}

/// Tearing down twice, or after processes exited on their own, is harmless
#[tokio::test]
async fn test_teardown_is_idempotent() -> Result<()> {
    init_tracing();

    let config = test_config();
    let mut processes = ProcessRegistry::new(config.launch_options());
    let done = processes.start(["true"])?;
    let sleeper = processes.start(["sleep", "30"])?;
    done.wait_out(Duration::from_secs(5)).await?;

    processes.teardown();
    processes.teardown();

    let err = sleeper.wait_out(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, HarnessError::UnexpectedExit { code: None, .. }), "{}", err);
    assert!(matches!(sleeper.state(), ProcessState::Killed(_)));
    assert!(matches!(done.state(), ProcessState::Exited(_)));
    Ok(())
}

/// Output from stdout and stderr lands in one buffer, in write order
#[tokio::test]
async fn test_combined_output_order() -> Result<()> {
    init_tracing();

    let out = ManagedProcess::run(
        ["sh", "-c", "echo one; echo two >&2; echo three"],
        &test_config().launch_options(),
        Duration::from_secs(5),
    )
    .await?;
    assert_eq!(out, "one\ntwo\nthree\n");
    Ok(())
}
