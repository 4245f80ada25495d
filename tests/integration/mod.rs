//! Integration tests for the example harness
//!
//! Drives the harness against `sh` stand-ins for the example programs, so the
//! whole lifecycle (launch, waits, cleanup, shared broker crash recovery) runs
//! against real subprocesses.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{init_tracing, test_config, FakeExamples};
