use crate::error::HarnessError;
use crate::Result;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Floor for the backoff so a zero initial delay still makes progress.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Repeatedly runs `check` with exponential backoff until it succeeds or `timeout` is spent.
///
/// `Ok(true)` is success. `Ok(false)` and `Err(_)` both mean "not yet": the
/// error is remembered and reported in [`HarnessError::RetryTimeout`] if the
/// budget runs out. The sleep between attempts starts at `initial_delay` and
/// doubles, the last one shortened so the total sleep never exceeds `timeout`;
/// one final check runs after that last sleep.
pub async fn retry<F, Fut, E>(
    what: &str,
    timeout: Duration,
    initial_delay: Duration,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    E: Display,
{
    let mut delay = initial_delay.max(MIN_DELAY);
    let mut slept = Duration::ZERO;
    let mut last_failure = None;
    let started = Instant::now();

    loop {
        match check().await {
            Ok(true) => {
                debug!("{} succeeded after {:?}", what, started.elapsed());
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                debug!("{} not ready: {}", what, e);
                last_failure = Some(e.to_string());
            }
        }

        let remaining = timeout.saturating_sub(slept);
        if remaining.is_zero() {
            return Err(HarnessError::RetryTimeout {
                what: what.to_string(),
                timeout,
                last_failure,
            });
        }

        let step = delay.min(remaining);
        sleep(step).await;
        slept += step;
        delay = delay.saturating_mul(2);
    }
}
