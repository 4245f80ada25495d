use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::environment::Environment;

/// Environment variable naming the memory checker every process is wrapped with.
pub const WRAPPER_ENV: &str = "VALGRIND";

/// Exit code the memory checker reports when it finds errors.
pub const WRAPPER_ERROR_EXIT_CODE: i32 = 42;

/// Memory-checking instrumentation placed in front of every launched argv.
#[derive(Debug, Clone, PartialEq)]
pub struct MemcheckWrapper {
    /// Path of the checker executable
    pub program: PathBuf,
}

impl MemcheckWrapper {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Reads the wrapper from `VALGRIND`; unset or empty means no wrapping.
    pub fn from_env() -> Option<Self> {
        match std::env::var_os(WRAPPER_ENV) {
            Some(value) if !value.is_empty() => {
                debug!("wrapping launched processes with {:?}", value);
                Some(Self::new(value))
            }
            _ => None,
        }
    }

    /// Arguments inserted before the real argv.
    pub fn prefix(&self) -> Vec<String> {
        vec![
            self.program.to_string_lossy().into_owned(),
            format!("--error-exitcode={}", WRAPPER_ERROR_EXIT_CODE),
            "--quiet".to_string(),
            "--leak-check=full".to_string(),
        ]
    }
}

/// Settings shared by every process the harness launches and every wait it performs.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Optional memory checker wrapping each launch
    pub wrapper: Option<MemcheckWrapper>,
    /// How often `wait_for_pattern` re-reads the output
    pub pattern_poll_interval: Duration,
    /// Bound for exit and readiness waits when the caller has no better one
    pub default_timeout: Duration,
    /// First sleep of the bounded retry; doubled on every attempt
    pub retry_initial_delay: Duration,
    /// Overall budget of the bounded retry
    pub retry_timeout: Duration,
    /// Host examples listen on
    pub host: IpAddr,
    /// Resource path appended to broker addresses
    pub resource_path: String,
    /// Output marker a listening process prints once it accepts connections
    pub readiness_pattern: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            wrapper: None,
            pattern_poll_interval: Duration::from_millis(10),
            default_timeout: Duration::from_secs(10),
            retry_initial_delay: Duration::from_millis(100),
            retry_timeout: Duration::from_secs(5),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            resource_path: "examples".to_string(),
            readiness_pattern: "listening".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Default configuration with the wrapper taken from the environment.
    pub fn from_env() -> Self {
        Self {
            wrapper: MemcheckWrapper::from_env(),
            ..Default::default()
        }
    }

    /// Launch options every process started under this configuration gets.
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            working_directory: None,
            environment: Environment::new(),
            wrapper: self.wrapper.clone(),
            pattern_poll_interval: self.pattern_poll_interval,
        }
    }
}

/// Per-launch options for a [`ManagedProcess`](crate::ManagedProcess).
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Working directory of the process, inherited when `None`
    pub working_directory: Option<PathBuf>,
    /// Overrides on top of the inherited environment
    pub environment: Environment,
    /// Memory checker to wrap the process with
    pub wrapper: Option<MemcheckWrapper>,
    /// Interval `wait_for_pattern` polls at
    pub pattern_poll_interval: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        HarnessConfig::default().launch_options()
    }
}

impl LaunchOptions {
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.set(key, value);
        self
    }

    /// The argv actually executed: wrapper prefix, if any, then `argv`.
    pub fn full_argv(&self, argv: &[String]) -> Vec<String> {
        let mut full = self
            .wrapper
            .as_ref()
            .map(MemcheckWrapper::prefix)
            .unwrap_or_default();
        full.extend(argv.iter().cloned());
        full
    }
}
