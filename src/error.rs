use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Argument vector of a launched process, printed space separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine(pub Vec<String>);

impl CommandLine {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(argv.into_iter().map(Into::into).collect())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(" "))
    }
}

/// Captured combined output attached to an error.
///
/// Renders trimmed; multi-line output is framed so it stands out in a test
/// failure report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput(pub String);

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let out = self.0.trim();
        if out.is_empty() {
            write!(f, "no output")
        } else if out.contains('\n') {
            write!(f, "\nvvvvvvvvvvvvvvvv\n{}\n^^^^^^^^^^^^^^^^\n", out)
        } else {
            write!(f, "{}", out)
        }
    }
}

/// Describes how a process ended: `code=N` or `killed by SIGNAME`.
pub fn describe_status(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        return format!("code={}", code);
    }
    match status.signal() {
        Some(raw) => match nix::sys::signal::Signal::try_from(raw) {
            Ok(signal) => format!("killed by {}", signal),
            Err(_) => format!("killed by signal {}", raw),
        },
        None => "code=unknown".to_string(),
    }
}

/// Why a process could not be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    /// The executable does not exist
    NotFound,
    /// Any other launch-time OS failure
    Other,
}

/// Failures of process interaction raised to the enclosing test case.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{argv} could not be started ({kind:?}): {source}")]
    Launch {
        argv: CommandLine,
        kind: LaunchErrorKind,
        #[source]
        source: io::Error,
    },

    #[error("{argv} still running after {timeout:?}, output: {output}")]
    StillRunning {
        argv: CommandLine,
        timeout: Duration,
        output: CapturedOutput,
    },

    #[error("{argv} bad exit status, expected code={expected}, got {status}, output: {output}")]
    UnexpectedExit {
        argv: CommandLine,
        expected: i32,
        status: String,
        code: Option<i32>,
        output: CapturedOutput,
    },

    #[error("{argv} gave up waiting for '{pattern}' after {timeout:?}, output: {output}")]
    PatternTimeout {
        argv: CommandLine,
        pattern: String,
        timeout: Duration,
        output: CapturedOutput,
    },

    #[error("timed out after {timeout:?} waiting for {what}: {}", last_failure.as_deref().unwrap_or("check never succeeded"))]
    RetryTimeout {
        what: String,
        timeout: Duration,
        last_failure: Option<String>,
    },

    #[error("{argv} shared process crashed ({status}), output: {output}")]
    SharedProcessCrash {
        argv: CommandLine,
        status: String,
        output: CapturedOutput,
    },

    #[error("invalid output pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("{argv} could not be waited on: {message}")]
    Wait { argv: CommandLine, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HarnessError {
    /// Builds the launch error for an OS spawn failure.
    pub(crate) fn launch(argv: CommandLine, source: io::Error) -> Self {
        let kind = if source.kind() == io::ErrorKind::NotFound {
            LaunchErrorKind::NotFound
        } else {
            LaunchErrorKind::Other
        };
        HarnessError::Launch { argv, kind, source }
    }

    /// True for launch failures caused by a missing executable.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HarnessError::Launch {
                kind: LaunchErrorKind::NotFound,
                ..
            }
        )
    }

    /// Output captured from the offending process, when the error carries one.
    pub fn output(&self) -> Option<&str> {
        match self {
            HarnessError::StillRunning { output, .. }
            | HarnessError::UnexpectedExit { output, .. }
            | HarnessError::PatternTimeout { output, .. }
            | HarnessError::SharedProcessCrash { output, .. } => Some(&output.0),
            _ => None,
        }
    }
}
