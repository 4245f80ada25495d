use crate::config::HarnessConfig;
use crate::fixture::SharedBroker;
use crate::port::{BrokerAddress, PortAllocator};
use crate::process::ManagedProcess;
use crate::registry::ProcessRegistry;
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Future returned by a test case body.
pub type CaseFuture<'a> = Pin<Box<dyn Future<Output = eyre::Result<()>> + 'a>>;

type CaseBody = Box<dyn for<'a> Fn(&'a mut CaseContext) -> CaseFuture<'a>>;

/// What a test case body gets to work with.
pub struct CaseContext {
    processes: ProcessRegistry,
    config: HarnessConfig,
    broker_addr: Option<BrokerAddress>,
    broker: Option<ManagedProcess>,
}

impl CaseContext {
    fn new(config: &HarnessConfig, broker: Option<&SharedBroker>) -> Self {
        Self {
            processes: ProcessRegistry::new(config.launch_options()),
            config: config.clone(),
            broker_addr: broker.and_then(|b| b.addr().cloned()),
            broker: broker.and_then(|b| b.process().cloned()),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Address of the group's shared broker, if the group has one.
    pub fn broker_addr(&self) -> Option<&BrokerAddress> {
        self.broker_addr.as_ref()
    }

    /// The group's shared broker process, if the group has one.
    pub fn broker(&self) -> Option<&ManagedProcess> {
        self.broker.as_ref()
    }

    /// Starts a process that is killed when the case ends.
    pub fn start<I, S>(&mut self, argv: I) -> crate::Result<ManagedProcess>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.processes.start(argv)
    }

    pub fn processes(&mut self) -> &mut ProcessRegistry {
        &mut self.processes
    }

    /// A fresh address on a free port, for cases that run their own listener.
    pub fn free_address(&self) -> io::Result<BrokerAddress> {
        let port = PortAllocator::new(self.config.host).free_port()?;
        Ok(BrokerAddress::new(
            self.config.host,
            port,
            self.config.resource_path.clone(),
        ))
    }

    /// Retries a TCP connect to `addr` with the configured backoff and budget.
    pub async fn wait_for_listener(&self, addr: &BrokerAddress) -> crate::Result<()> {
        PortAllocator::wait_for_listener(
            addr.socket_addr(),
            self.config.retry_timeout,
            self.config.retry_initial_delay,
        )
        .await
    }
}

/// Result of one test case.
#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub name: String,
    pub duration: Duration,
    /// Rendered failure, `None` if the case passed
    pub failure: Option<String>,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Outcomes of every case a group ran, in order.
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub group: String,
    pub outcomes: Vec<CaseOutcome>,
}

impl GroupReport {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }

    pub fn outcome(&self, name: &str) -> Option<&CaseOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

impl fmt::Display for GroupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} passed, {} failed",
            self.group,
            self.passed(),
            self.failed()
        )?;
        for outcome in &self.outcomes {
            match &outcome.failure {
                None => writeln!(f, "  ok   {} ({:?})", outcome.name, outcome.duration)?,
                Some(failure) => writeln!(f, "  FAIL {} ({:?}): {}", outcome.name, outcome.duration, failure)?,
            }
        }
        Ok(())
    }
}

/// A sequence of test cases sharing an optional long-lived broker.
///
/// Running the group performs the group setup (start the broker), then for
/// each case: fresh [`ProcessRegistry`], case body, registry teardown and the
/// shared-broker crash check. The broker is killed after the last case.
pub struct TestGroup {
    name: String,
    config: HarnessConfig,
    broker: Option<SharedBroker>,
    cases: Vec<(String, CaseBody)>,
}

impl TestGroup {
    pub fn new(name: impl Into<String>, config: HarnessConfig) -> Self {
        Self {
            name: name.into(),
            config,
            broker: None,
            cases: Vec::new(),
        }
    }

    /// Shares one broker, launched as `command -a <addr>`, across all cases.
    pub fn with_shared_broker(mut self, command: Vec<String>) -> Self {
        self.broker = Some(SharedBroker::new(command, self.config.clone()));
        self
    }

    /// Appends a named case.
    pub fn case<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: for<'a> Fn(&'a mut CaseContext) -> CaseFuture<'a> + 'static,
    {
        self.cases.push((name.into(), Box::new(body)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs every case whose name contains `filter` (all when `None`).
    pub async fn run(mut self, filter: Option<&str>) -> GroupReport {
        let cases: Vec<_> = std::mem::take(&mut self.cases)
            .into_iter()
            .filter(|(name, _)| filter.map_or(true, |f| name.contains(f)))
            .collect();
        let mut report = GroupReport {
            group: self.name.clone(),
            outcomes: Vec::with_capacity(cases.len()),
        };
        if cases.is_empty() {
            return report;
        }

        info!("running group {} ({} cases)", self.name, cases.len());

        if let Some(ref mut broker) = self.broker {
            if let Err(e) = broker.setup().await {
                error!("group {} setup failed: {}", self.name, e);
                let failure = format!("group setup failed: {}", e);
                report.outcomes = cases
                    .into_iter()
                    .map(|(name, _)| CaseOutcome {
                        name,
                        duration: Duration::ZERO,
                        failure: Some(failure.clone()),
                    })
                    .collect();
                return report;
            }
        }

        for (name, body) in &cases {
            let started = Instant::now();
            let failure = self.run_case(name, body).await.err();
            match failure {
                None => info!("{} ... ok", name),
                Some(ref failure) => error!("{} ... FAILED: {}", name, failure),
            }
            report.outcomes.push(CaseOutcome {
                name: name.clone(),
                duration: started.elapsed(),
                failure,
            });
        }

        if let Some(ref mut broker) = self.broker {
            broker.teardown();
        }
        report
    }

    async fn run_case(&mut self, name: &str, body: &CaseBody) -> Result<(), String> {
        if let Some(ref mut broker) = self.broker {
            broker
                .ensure_started()
                .await
                .map_err(|e| format!("shared broker unavailable: {}", e))?;
        }

        info!("{} ... started", name);
        let mut ctx = CaseContext::new(&self.config, self.broker.as_ref());
        let result = match AssertUnwindSafe(body(&mut ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(eyre::eyre!("case panicked: {}", panic_message(payload.as_ref()))),
        };
        ctx.processes.teardown();

        let crash = match self.broker {
            Some(ref mut broker) => broker.check_after_test().await,
            None => Ok(()),
        };

        match (result, crash) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(format!("{:#}", e)),
            (Ok(()), Err(crash)) => Err(crash.to_string()),
            (Err(e), Err(crash)) => Err(format!("{:#}; then {}", e, crash)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
