//! Drives networked example programs as subprocesses and checks their output.
//!
//! The harness launches each program with its stdout and stderr captured in
//! one ordered buffer, waits on it with caller-side timeouts, synchronizes on
//! output patterns, and guarantees that every process a test starts is killed
//! when the test ends. A [`TestGroup`] can share one long-lived broker between
//! its cases and replaces it transparently if it crashes.

pub mod config;
pub mod environment;
pub mod error;
pub mod fixture;
pub mod group;
pub mod output;
pub mod port;
pub mod process;
pub mod registry;
pub mod retry;
pub mod scenarios;

pub use config::{HarnessConfig, LaunchOptions, MemcheckWrapper};
pub use environment::Environment;
pub use error::{CapturedOutput, CommandLine, HarnessError, LaunchErrorKind};
pub use fixture::SharedBroker;
pub use group::{CaseContext, CaseFuture, CaseOutcome, GroupReport, TestGroup};
pub use port::{BoundPort, BrokerAddress, PortAllocator};
pub use process::{ManagedProcess, PatternMatch, ProcessState};
pub use registry::ProcessRegistry;
pub use retry::retry;

pub type Result<T> = std::result::Result<T, HarnessError>;
