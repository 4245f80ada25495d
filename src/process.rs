use crate::config::LaunchOptions;
use crate::error::{describe_status, CapturedOutput, CommandLine, HarnessError};
use crate::output::{capture, OutputBuffer};
use crate::Result;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::pipe2;
use regex::Regex;
use std::io;
use std::ops::Range;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Longest a finished wait lingers for the output pipe to reach end-of-file.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// State of a managed process.
///
/// [`ManagedProcess::start`] is the only constructor, so a process that was
/// never started is never observable. Both terminal states are absorbing.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessState {
    /// Process is running
    Running,
    /// Process terminated on its own
    Exited(ExitStatus),
    /// Process was terminated by [`ManagedProcess::kill`]
    Killed(ExitStatus),
    /// The OS wait on the process failed; its fate is unknown
    Lost(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Running)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            ProcessState::Exited(status) | ProcessState::Killed(status) => Some(*status),
            ProcessState::Running | ProcessState::Lost(_) => None,
        }
    }
}

/// A regex match found in a process's output.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    text: String,
    range: Range<usize>,
    groups: Vec<Option<String>>,
}

impl PatternMatch {
    fn from_captures(captures: &regex::Captures<'_>) -> Option<Self> {
        let whole = captures.get(0)?;
        Some(Self {
            text: whole.as_str().to_string(),
            range: whole.range(),
            groups: captures
                .iter()
                .skip(1)
                .map(|group| group.map(|g| g.as_str().to_string()))
                .collect(),
        })
    }

    /// The matched text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Byte range of the match within the output it was found in.
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Capture group `index` (1-based, like the regex it came from).
    pub fn group(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .and_then(|group| group.as_deref())
    }
}

struct Inner {
    argv: CommandLine,
    pid: Option<u32>,
    output: OutputBuffer,
    status: watch::Receiver<ProcessState>,
    drained: watch::Receiver<bool>,
    kill_tx: mpsc::UnboundedSender<()>,
    poll_interval: Duration,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.status.borrow().is_terminal() {
            debug!("last handle to {} dropped, killing it", self.argv);
            let _ = self.kill_tx.send(());
        }
    }
}

/// One spawned example program with its combined output captured.
///
/// Cloning gives another handle onto the same OS process. A supervisory task
/// owns the child, reaps it and publishes its terminal state; waits on this
/// handle are bounded from the caller side and never block past their
/// timeout.
#[derive(Clone)]
pub struct ManagedProcess {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("argv", &self.inner.argv)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedProcess {
    /// Launches `argv` with stdout and stderr sharing one ordered buffer.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`HarnessError::Launch`] of kind `NotFound` when the executable does
    /// not exist and kind `Other` for any other launch failure.
    pub fn start<I, S>(argv: I, options: &LaunchOptions) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = CommandLine::new(argv);
        let full_argv = options.full_argv(argv.as_slice());
        let (program, args) = full_argv.split_first().ok_or_else(|| {
            HarnessError::launch(
                argv.clone(),
                io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"),
            )
        })?;

        // One pipe for both streams keeps their writes in order.
        let (read_end, write_end) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| HarnessError::launch(argv.clone(), e.into()))?;
        let stderr_end = write_end
            .try_clone()
            .map_err(|e| HarnessError::launch(argv.clone(), e))?;
        let reader = pipe::Receiver::from_owned_fd(read_end)
            .map_err(|e| HarnessError::launch(argv.clone(), e))?;

        let mut command = Command::new(program);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::from(write_end));
        command.stderr(Stdio::from(stderr_end));
        command.kill_on_drop(true);
        if let Some(ref dir) = options.working_directory {
            command.current_dir(dir);
        }
        options.environment.apply(&mut command);

        let spawned = command.spawn();
        // Close our copies of the write end so the reader sees EOF when the child exits.
        drop(command);
        let child = spawned.map_err(|e| HarnessError::launch(argv.clone(), e))?;
        let pid = child.id();

        info!("started {} (pid {:?})", argv, pid);

        let output = OutputBuffer::new();
        let (drained_tx, drained_rx) = watch::channel(false);
        tokio::spawn(capture(reader, output.clone(), drained_tx));

        let (status_tx, status_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(child, argv.clone(), kill_rx, status_tx));

        Ok(Self {
            inner: Arc::new(Inner {
                argv,
                pid,
                output,
                status: status_rx,
                drained: drained_rx,
                kill_tx,
                poll_interval: options.pattern_poll_interval,
            }),
        })
    }

    /// Launches `argv` and waits for it to exit with code 0.
    pub async fn run<I, S>(argv: I, options: &LaunchOptions, timeout: Duration) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::start(argv, options)?.wait_out(timeout).await
    }

    /// The argument vector this process was launched with, without any wrapper.
    pub fn argv(&self) -> &CommandLine {
        &self.inner.argv
    }

    /// OS process id, if the OS reported one at launch.
    pub fn id(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn state(&self) -> ProcessState {
        self.inner.status.borrow().clone()
    }

    /// Non-blocking liveness check.
    pub fn is_running(&self) -> bool {
        !self.inner.status.borrow().is_terminal()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.status.borrow().exit_status()
    }

    /// Output accumulated so far; safe while the process is still writing.
    pub fn current_output(&self) -> String {
        self.inner.output.snapshot()
    }

    /// Forcefully terminates the process if it is still running.
    ///
    /// Signal-and-return: never waits for the process to die, and is a no-op
    /// for a process that already terminated. Returns the output captured so far.
    pub fn kill(&self) -> String {
        if self.is_running() {
            debug!("killing {}", self.inner.argv);
            // The supervisor is gone only once the process has been reaped.
            let _ = self.inner.kill_tx.send(());
        }
        self.current_output()
    }

    /// Waits for the process to exit and returns its complete output.
    ///
    /// If it is still running after `timeout` it is killed and
    /// [`HarnessError::StillRunning`] is returned. With `expect` set, any other
    /// exit code (or a death by signal) yields [`HarnessError::UnexpectedExit`].
    pub async fn wait_for_exit(&self, timeout: Duration, expect: Option<i32>) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut status = self.inner.status.clone();

        let state = match timeout_at(deadline, status.wait_for(ProcessState::is_terminal)).await {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => ProcessState::Lost("supervisor task ended".to_string()),
            Err(_) => {
                let output = self.kill();
                warn!("{} still running after {:?}, killed", self.inner.argv, timeout);
                return Err(HarnessError::StillRunning {
                    argv: self.inner.argv.clone(),
                    timeout,
                    output: CapturedOutput(output),
                });
            }
        };

        let exit = match state {
            ProcessState::Lost(message) => {
                return Err(HarnessError::Wait {
                    argv: self.inner.argv.clone(),
                    message,
                })
            }
            other => other.exit_status(),
        };

        self.wait_for_drain(deadline.min(Instant::now() + OUTPUT_DRAIN_GRACE))
            .await;
        let output = self.current_output();

        if let Some(expected) = expect {
            let code = exit.and_then(|s| s.code());
            if code != Some(expected) {
                return Err(HarnessError::UnexpectedExit {
                    argv: self.inner.argv.clone(),
                    expected,
                    status: exit
                        .as_ref()
                        .map(describe_status)
                        .unwrap_or_else(|| "unknown status".to_string()),
                    code,
                    output: CapturedOutput(output),
                });
            }
        }

        Ok(output)
    }

    /// [`wait_for_exit`](Self::wait_for_exit) expecting a zero exit code.
    pub async fn wait_out(&self, timeout: Duration) -> Result<String> {
        self.wait_for_exit(timeout, Some(0)).await
    }

    /// Polls the output until `pattern` matches or `timeout` elapses.
    ///
    /// The target process should flush its readiness marker for it to show up.
    pub async fn wait_for_pattern(&self, pattern: &str, timeout: Duration) -> Result<PatternMatch> {
        let regex = Regex::new(pattern)?;
        self.wait_for_regex(&regex, timeout).await
    }

    /// [`wait_for_pattern`](Self::wait_for_pattern) with a precompiled regex.
    pub async fn wait_for_regex(&self, regex: &Regex, timeout: Duration) -> Result<PatternMatch> {
        let deadline = Instant::now() + timeout;
        loop {
            let output = self.current_output();
            if let Some(found) = regex
                .captures(&output)
                .and_then(|captures| PatternMatch::from_captures(&captures))
            {
                debug!("{} matched '{}'", self.inner.argv, regex);
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::PatternTimeout {
                    argv: self.inner.argv.clone(),
                    pattern: regex.to_string(),
                    timeout,
                    output: CapturedOutput(output),
                });
            }
            sleep(self.inner.poll_interval.min(deadline - now)).await;
        }
    }

    async fn wait_for_drain(&self, deadline: Instant) {
        let mut drained = self.inner.drained.clone();
        if timeout_at(deadline, drained.wait_for(|done| *done)).await.is_err() {
            debug!(
                "{} exited with its output still held open, using what was captured",
                self.inner.argv
            );
        }
    }
}

/// Owns the child until it is reaped; delivers kill requests.
async fn supervise(
    mut child: Child,
    argv: CommandLine,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    status: watch::Sender<ProcessState>,
) {
    let started = Instant::now();
    let mut killed = false;

    let result = loop {
        tokio::select! {
            result = child.wait() => break result,
            Some(()) = kill_rx.recv(), if !killed => {
                match child.start_kill() {
                    Ok(()) => killed = true,
                    Err(e) => warn!("failed to kill {}: {}", argv, e),
                }
            }
        }
    };

    let state = match result {
        Ok(exit) => {
            let state = terminal_state(exit, killed);
            let verb = if matches!(state, ProcessState::Killed(_)) { "killed" } else { "exited" };
            info!("{} {} after {:?} ({})", argv, verb, started.elapsed(), describe_status(&exit));
            state
        }
        Err(e) => {
            error!("error waiting for {}: {}", argv, e);
            ProcessState::Lost(e.to_string())
        }
    };
    status.send_replace(state);
}

/// A kill only counts if it is what ended the process: one that had already
/// exited on its own when the kill arrived keeps its own status.
fn terminal_state(exit: ExitStatus, kill_sent: bool) -> ProcessState {
    use std::os::unix::process::ExitStatusExt;

    if kill_sent && exit.signal() == Some(Signal::SIGKILL as i32) {
        ProcessState::Killed(exit)
    } else {
        ProcessState::Exited(exit)
    }
}
