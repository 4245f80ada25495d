use crate::config::HarnessConfig;
use crate::error::{describe_status, CapturedOutput, HarnessError};
use crate::port::{BrokerAddress, PortAllocator};
use crate::process::{ManagedProcess, ProcessState};
use crate::Result;
use tracing::{error, info, warn};

/// A broker process shared by every test case of a group.
///
/// Started once by [`setup`](Self::setup) and killed by
/// [`teardown`](Self::teardown). Between cases
/// [`check_after_test`](Self::check_after_test) notices a broker that died
/// on its own, starts a replacement, and reports the crash as the failure of
/// the case that just ran.
#[derive(Debug)]
pub struct SharedBroker {
    /// Broker executable and any leading arguments; `-a <addr>` is appended
    command: Vec<String>,
    config: HarnessConfig,
    allocator: PortAllocator,
    broker: Option<ManagedProcess>,
    addr: Option<BrokerAddress>,
    restarts: usize,
}

impl SharedBroker {
    pub fn new(command: Vec<String>, config: HarnessConfig) -> Self {
        Self {
            command,
            allocator: PortAllocator::new(config.host),
            config,
            broker: None,
            addr: None,
            restarts: 0,
        }
    }

    /// Starts a broker on a fresh port and waits for its readiness marker.
    ///
    /// Any broker this fixture already holds is killed first. If the launch
    /// or the readiness wait fails, the half-started broker is killed and the
    /// error returned.
    pub async fn setup(&mut self) -> Result<()> {
        self.teardown();

        let port = self.allocator.acquire()?.release();
        let addr = BrokerAddress::new(self.config.host, port, self.config.resource_path.clone());

        let mut argv = self.command.clone();
        argv.push("-a".to_string());
        argv.push(addr.to_string());

        let broker = ManagedProcess::start(argv, &self.config.launch_options())?;
        if let Err(e) = broker
            .wait_for_pattern(&self.config.readiness_pattern, self.config.default_timeout)
            .await
        {
            broker.kill();
            return Err(e);
        }

        info!("shared broker ready on {}", addr);
        self.broker = Some(broker);
        self.addr = Some(addr);
        Ok(())
    }

    /// Runs [`setup`](Self::setup) unless a broker is already held.
    pub async fn ensure_started(&mut self) -> Result<()> {
        if self.broker.is_none() {
            self.setup().await?;
        }
        Ok(())
    }

    /// Kills the shared broker, if there is one.
    pub fn teardown(&mut self) {
        if let Some(broker) = self.broker.take() {
            broker.kill();
        }
        self.addr = None;
    }

    /// Per-test check: replaces a broker that exited and reports the crash.
    ///
    /// Only looks at the broker's current state, it never waits on it. A
    /// failed restart is logged and leaves the fixture empty; the next
    /// [`ensure_started`](Self::ensure_started) tries again.
    pub async fn check_after_test(&mut self) -> Result<()> {
        let state = match self.broker.as_ref() {
            Some(broker) => broker.state(),
            None => return Ok(()),
        };
        if !state.is_terminal() {
            return Ok(());
        }

        let crashed = match self.broker.take() {
            Some(broker) => broker,
            None => return Ok(()),
        };
        self.addr = None;

        let crash = HarnessError::SharedProcessCrash {
            argv: crashed.argv().clone(),
            status: describe_state(&state),
            output: CapturedOutput(crashed.current_output()),
        };
        warn!("{}", crash);

        match self.setup().await {
            Ok(()) => self.restarts += 1,
            Err(e) => error!("could not restart shared broker: {}", e),
        }
        Err(crash)
    }

    /// Address of the live broker.
    pub fn addr(&self) -> Option<&BrokerAddress> {
        self.addr.as_ref()
    }

    pub fn process(&self) -> Option<&ManagedProcess> {
        self.broker.as_ref()
    }

    /// How many times a crashed broker has been replaced.
    pub fn restarts(&self) -> usize {
        self.restarts
    }
}

impl Drop for SharedBroker {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn describe_state(state: &ProcessState) -> String {
    match state {
        ProcessState::Exited(status) | ProcessState::Killed(status) => describe_status(status),
        ProcessState::Lost(message) => format!("lost: {}", message),
        ProcessState::Running => "running".to_string(),
    }
}
