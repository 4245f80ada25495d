//! End-to-end cases for the messaging example programs.
//!
//! Each case drives the broker, send, receive and direct executables as
//! opaque subprocesses and checks their exact output.

use crate::config::HarnessConfig;
use crate::error::CapturedOutput;
use crate::group::{CaseContext, CaseFuture, TestGroup};
use eyre::{bail, eyre};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Messages a send/receive pair exchanges unless told otherwise.
pub const DEFAULT_MESSAGE_COUNT: usize = 100;

/// Message count and inter-message delay of the timed send case.
pub const TIMED_SEND_COUNT: usize = 3;
pub const TIMED_SEND_DELAY: Duration = Duration::from_millis(100);

/// Command prefixes of the example programs under test.
#[derive(Debug, Clone, PartialEq)]
pub struct Examples {
    pub broker: Vec<String>,
    pub send: Vec<String>,
    pub receive: Vec<String>,
    pub direct: Vec<String>,
}

impl Examples {
    /// The four executables as they are named in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        let exe = |name: &str| vec![dir.join(name).to_string_lossy().into_owned()];
        Self {
            broker: exe("broker"),
            send: exe("send"),
            receive: exe("receive"),
            direct: exe("direct"),
        }
    }

    fn argv(prefix: &[String], addr: &str, flags: &[String]) -> Vec<String> {
        let mut argv = prefix.to_vec();
        argv.push("-a".to_string());
        argv.push(addr.to_string());
        argv.extend(flags.iter().cloned());
        argv
    }
}

/// Final output line of a sender that delivered `count` messages.
pub fn send_expect(count: usize) -> String {
    format!("{} messages sent and acknowledged\n", count)
}

/// Complete output of a receiver that got `count` messages.
pub fn receive_expect(count: usize) -> String {
    let mut out: String = (1..=count)
        .map(|n| format!("{{\"sequence\"={}}}\n", n))
        .collect();
    out.push_str(&format!("{} messages received\n", count));
    out
}

/// Bound for a sender pausing `delay` between `count` messages.
///
/// Four times the total pause on top of the usual bound, so slow or
/// instrumented runs still finish.
pub fn timed_send_timeout(base: Duration, count: usize, delay: Duration) -> Duration {
    let count = u32::try_from(count).unwrap_or(u32::MAX);
    base + delay.saturating_mul(count).saturating_mul(4)
}

fn count_flag(count: usize) -> String {
    format!("-m{}", count)
}

fn expect_equal(what: &str, actual: &str, expected: &str) -> eyre::Result<()> {
    if actual != expected {
        bail!(
            "{}: expected {:?}, got {}",
            what,
            expected.lines().last().unwrap_or(""),
            CapturedOutput(actual.to_string())
        );
    }
    Ok(())
}

fn expect_contains(what: &str, actual: &str, expected: &str) -> eyre::Result<()> {
    if !actual.contains(expected) {
        bail!(
            "{}: missing {:?}, got {}",
            what,
            expected.lines().last().unwrap_or(""),
            CapturedOutput(actual.to_string())
        );
    }
    Ok(())
}

fn shared_broker_addr(ctx: &CaseContext) -> eyre::Result<String> {
    ctx.broker_addr()
        .map(ToString::to_string)
        .ok_or_else(|| eyre!("case needs a shared broker"))
}

/// Send first, then receive everything that was sent.
pub fn send_then_receive(ctx: &mut CaseContext, examples: Arc<Examples>, count: usize) -> CaseFuture<'_> {
    Box::pin(async move {
        let addr = shared_broker_addr(ctx)?;
        let timeout = ctx.config().default_timeout;
        let flags = [count_flag(count)];

        let sender = ctx.start(Examples::argv(&examples.send, &addr, &flags))?;
        expect_equal("send", &sender.wait_out(timeout).await?, &send_expect(count))?;

        let receiver = ctx.start(Examples::argv(&examples.receive, &addr, &flags))?;
        expect_equal("receive", &receiver.wait_out(timeout).await?, &receive_expect(count))?;
        Ok(())
    })
}

/// Start receiving first, then send.
pub fn receive_then_send(ctx: &mut CaseContext, examples: Arc<Examples>, count: usize) -> CaseFuture<'_> {
    Box::pin(async move {
        let addr = shared_broker_addr(ctx)?;
        let timeout = ctx.config().default_timeout;
        let flags = [count_flag(count)];

        let receiver = ctx.start(Examples::argv(&examples.receive, &addr, &flags))?;
        let sender = ctx.start(Examples::argv(&examples.send, &addr, &flags))?;

        expect_equal("send", &sender.wait_out(timeout).await?, &send_expect(count))?;
        expect_equal("receive", &receiver.wait_out(timeout).await?, &receive_expect(count))?;
        Ok(())
    })
}

/// Send a few messages with a pause between each, then receive them.
pub fn timed_send(ctx: &mut CaseContext, examples: Arc<Examples>) -> CaseFuture<'_> {
    Box::pin(async move {
        let addr = shared_broker_addr(ctx)?;
        let timeout = timed_send_timeout(ctx.config().default_timeout, TIMED_SEND_COUNT, TIMED_SEND_DELAY);
        let send_flags = [
            format!("-d{}", TIMED_SEND_DELAY.as_millis()),
            count_flag(TIMED_SEND_COUNT),
        ];

        let sender = ctx.start(Examples::argv(&examples.send, &addr, &send_flags))?;
        expect_equal("send", &sender.wait_out(timeout).await?, &send_expect(TIMED_SEND_COUNT))?;

        let receiver = ctx.start(Examples::argv(
            &examples.receive,
            &addr,
            &[count_flag(TIMED_SEND_COUNT)],
        ))?;
        expect_equal(
            "receive",
            &receiver.wait_out(timeout).await?,
            &receive_expect(TIMED_SEND_COUNT),
        )?;
        Ok(())
    })
}

/// Send straight to a direct peer, which acts as the receiver.
pub fn send_to_direct(ctx: &mut CaseContext, examples: Arc<Examples>, count: usize) -> CaseFuture<'_> {
    Box::pin(async move {
        let listen = ctx.free_address()?;
        let addr = listen.to_string();
        let timeout = ctx.config().default_timeout;
        let readiness = ctx.config().readiness_pattern.clone();
        let flags = [count_flag(count)];

        let direct = ctx.start(Examples::argv(&examples.direct, &addr, &flags))?;
        direct.wait_for_pattern(&readiness, timeout).await?;
        ctx.wait_for_listener(&listen).await?;

        let sender = ctx.start(Examples::argv(&examples.send, &addr, &flags))?;
        expect_equal("send", &sender.wait_out(timeout).await?, &send_expect(count))?;
        expect_contains("direct", &direct.wait_out(timeout).await?, &receive_expect(count))?;
        Ok(())
    })
}

/// Receive straight from a direct peer, which acts as the sender.
pub fn receive_from_direct(ctx: &mut CaseContext, examples: Arc<Examples>, count: usize) -> CaseFuture<'_> {
    Box::pin(async move {
        let listen = ctx.free_address()?;
        let addr = listen.to_string();
        let timeout = ctx.config().default_timeout;
        let readiness = ctx.config().readiness_pattern.clone();
        let flags = [count_flag(count)];

        let direct = ctx.start(Examples::argv(&examples.direct, &addr, &flags))?;
        direct.wait_for_pattern(&readiness, timeout).await?;
        ctx.wait_for_listener(&listen).await?;

        let receiver = ctx.start(Examples::argv(&examples.receive, &addr, &flags))?;
        expect_equal("receive", &receiver.wait_out(timeout).await?, &receive_expect(count))?;
        expect_contains("direct", &direct.wait_out(timeout).await?, &send_expect(count))?;
        Ok(())
    })
}

/// Cases that share one broker for the whole group.
pub fn broker_group(config: HarnessConfig, examples: Arc<Examples>, count: usize) -> TestGroup {
    let (a, b, c) = (examples.clone(), examples.clone(), examples.clone());
    TestGroup::new("broker", config)
        .with_shared_broker(examples.broker.clone())
        .case("send_receive", move |ctx| send_then_receive(ctx, a.clone(), count))
        .case("receive_send", move |ctx| receive_then_send(ctx, b.clone(), count))
        .case("timed_send", move |ctx| timed_send(ctx, c.clone()))
}

/// Cases where the direct peer stands in for the broker.
pub fn direct_group(config: HarnessConfig, examples: Arc<Examples>, count: usize) -> TestGroup {
    let (a, b) = (examples.clone(), examples);
    TestGroup::new("direct", config)
        .case("send_direct", move |ctx| send_to_direct(ctx, a.clone(), count))
        .case("receive_direct", move |ctx| receive_from_direct(ctx, b.clone(), count))
}
