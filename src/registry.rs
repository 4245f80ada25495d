use crate::config::LaunchOptions;
use crate::process::ManagedProcess;
use crate::Result;
use tracing::debug;

/// Every process one test case started, killed when the case ends.
///
/// [`teardown`](Self::teardown) is the explicit cleanup hook; dropping the
/// registry runs it too, so a panicking test body cannot leak processes.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    options: LaunchOptions,
    processes: Vec<ManagedProcess>,
}

impl ProcessRegistry {
    /// Registry whose processes are launched with `options` unless told otherwise.
    pub fn new(options: LaunchOptions) -> Self {
        Self {
            options,
            processes: Vec::new(),
        }
    }

    /// Starts `argv` with the registry's launch options and tracks it.
    pub fn start<I, S>(&mut self, argv: I) -> Result<ManagedProcess>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options = self.options.clone();
        self.start_with(argv, &options)
    }

    /// Starts `argv` with explicit launch options and tracks it.
    pub fn start_with<I, S>(&mut self, argv: I, options: &LaunchOptions) -> Result<ManagedProcess>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let process = ManagedProcess::start(argv, options)?;
        self.processes.push(process.clone());
        Ok(process)
    }

    /// Tracked processes in creation order.
    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Kills every tracked process and forgets them.
    pub fn teardown(&mut self) {
        for process in self.processes.drain(..) {
            if process.is_running() {
                debug!("teardown killing {}", process.argv());
            }
            process.kill();
        }
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}
