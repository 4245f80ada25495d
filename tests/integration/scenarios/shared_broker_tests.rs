use crate::integration::{init_tracing, test_config, FakeExamples};
use anyhow::Result;
use example_harness::scenarios::send_then_receive;
use example_harness::{CaseContext, CaseFuture, TestGroup};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SeenPid = Arc<Mutex<Option<u32>>>;

fn kills_broker(ctx: &mut CaseContext, seen: SeenPid) -> CaseFuture<'_> {
    Box::pin(async move {
        let broker = ctx.broker().ok_or_else(|| eyre::eyre!("no shared broker"))?.clone();
        let pid = broker.id().ok_or_else(|| eyre::eyre!("broker has no pid"))?;
        *seen.lock().unwrap() = Some(pid);

        kill(Pid::from_raw(pid as i32), Signal::SIGKILL)?;
        for _ in 0..500 {
            if !broker.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        eyre::ensure!(!broker.is_running(), "broker survived SIGKILL");
        Ok(())
    })
}

fn sees_replacement(ctx: &mut CaseContext, seen: SeenPid) -> CaseFuture<'_> {
    Box::pin(async move {
        let broker = ctx.broker().ok_or_else(|| eyre::eyre!("no shared broker"))?;
        eyre::ensure!(broker.is_running(), "replacement broker not running");

        let old = *seen.lock().unwrap();
        eyre::ensure!(broker.id() != old, "broker was not replaced");
        Ok(())
    })
}

/// A crashed shared broker fails only the case it crashed in
#[tokio::test]
async fn test_broker_crash_fails_one_case() -> Result<()> {
    init_tracing();

    let fake = FakeExamples::new()?;
    let examples = fake.examples();
    let seen: SeenPid = Arc::new(Mutex::new(None));
    let (a, b) = (seen.clone(), seen.clone());

    let report = TestGroup::new("crash", test_config())
        .with_shared_broker(examples.broker.clone())
        .case("kills_broker", move |ctx| kills_broker(ctx, a.clone()))
        .case("sees_replacement", move |ctx| sees_replacement(ctx, b.clone()))
        .case("send_receive", move |ctx| send_then_receive(ctx, examples.clone(), 5))
        .run(None)
        .await;

    assert_eq!(report.failed(), 1, "{}", report);
    let failure = report.outcome("kills_broker").unwrap().failure.clone().unwrap();
    assert!(failure.contains("shared process crashed (killed by SIGKILL)"), "{}", failure);
    assert!(failure.contains("listening on 127.0.0.1:"), "{}", failure);
    assert!(report.outcome("sees_replacement").unwrap().passed());
    assert!(report.outcome("send_receive").unwrap().passed());
    assert!(seen.lock().unwrap().is_some());
    Ok(())
}

/// A broker that never becomes ready fails the whole group
#[tokio::test]
async fn test_broker_never_ready() -> Result<()> {
    init_tracing();

    let fake = FakeExamples::new()?.with_script("broker", "echo 'bind: address in use' >&2\nexit 3\n")?;
    let mut config = test_config();
    config.default_timeout = Duration::from_secs(2);

    let report = TestGroup::new("unready", config)
        .with_shared_broker(fake.examples().broker.clone())
        .case("a", |ctx| sees_replacement(ctx, Arc::new(Mutex::new(None))))
        .case("b", |ctx| sees_replacement(ctx, Arc::new(Mutex::new(None))))
        .run(None)
        .await;

    assert_eq!(report.failed(), 2);
    for outcome in report.failures() {
        let failure = outcome.failure.as_deref().unwrap();
        assert!(failure.starts_with("group setup failed"), "{}", failure);
        assert!(failure.contains("bind: address in use"), "{}", failure);
    }
    Ok(())
}
