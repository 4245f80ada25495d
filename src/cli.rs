use clap::Parser;
use eyre::eyre;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use example_harness::{HarnessConfig, MemcheckWrapper};

type Result<T> = color_eyre::eyre::Result<T>;

/// Runs the messaging example programs end to end and checks their output
#[derive(Parser)]
#[command(name = "example-harness")]
#[command(about = "Runs the messaging example programs end to end and checks their output")]
#[command(version)]
pub struct Cli {
    /// Directory containing the broker, send, receive and direct executables
    #[arg(long)]
    pub bin_dir: PathBuf,

    /// Messages exchanged by the send/receive cases
    #[arg(long, default_value = "100")]
    pub messages: usize,

    /// Bound for each exit or readiness wait (seconds)
    #[arg(long, default_value = "10")]
    pub timeout_secs: u64,

    /// Output polling interval while waiting for a pattern (ms)
    #[arg(long, default_value = "10")]
    pub poll_interval_ms: u64,

    /// Overall budget for connecting to a freshly started listener (ms)
    #[arg(long, default_value = "5000")]
    pub retry_timeout_ms: u64,

    /// First backoff delay of the listener check, doubled on every attempt (ms)
    #[arg(long, default_value = "100")]
    pub retry_initial_delay_ms: u64,

    /// Host the examples listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Only run cases whose name contains this string
    #[arg(long)]
    pub filter: Option<String>,

    /// Memory checker to wrap every example with, instead of `$VALGRIND`
    #[arg(long)]
    pub valgrind: Option<PathBuf>,
}

/// Configuration for one harness run
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the example executables live
    pub bin_dir: PathBuf,
    /// Messages exchanged per send/receive case
    pub messages: usize,
    /// Case name filter
    pub filter: Option<String>,
    /// Settings for launching and waiting on processes
    pub harness: HarnessConfig,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let host: IpAddr = cli
            .host
            .parse()
            .map_err(|e| eyre!("Invalid host '{}': {}", cli.host, e))?;

        if !cli.bin_dir.is_dir() {
            return Err(eyre!("Example directory '{}' does not exist", cli.bin_dir.display()));
        }

        let base = HarnessConfig::from_env();
        let wrapper = match cli.valgrind {
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(MemcheckWrapper::new(path)),
            None => base.wrapper.clone(),
        };

        Ok(Config {
            bin_dir: cli.bin_dir,
            messages: cli.messages,
            filter: cli.filter,
            harness: HarnessConfig {
                wrapper,
                pattern_poll_interval: Duration::from_millis(cli.poll_interval_ms),
                default_timeout: Duration::from_secs(cli.timeout_secs),
                retry_initial_delay: Duration::from_millis(cli.retry_initial_delay_ms),
                retry_timeout: Duration::from_millis(cli.retry_timeout_ms),
                host,
                ..base
            },
        })
    }
}
