pub mod fake_examples;

pub use fake_examples::FakeExamples;

use example_harness::HarnessConfig;
use std::time::Duration;

/// Harness settings for tests: short waits, no memory checker.
pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        default_timeout: Duration::from_secs(15),
        wrapper: None,
        ..Default::default()
    }
}

/// Installs the test log writer once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
