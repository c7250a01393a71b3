//! Tracing for tests that cannot use `#[test_log::test]`, such as
//! `#[tokio::test(start_paused = true)]` supervision tests.

use tracing_subscriber::EnvFilter;

/// Daemon and worker records at debug, everything else at info.
const DEFAULT_FILTER: &str = "info,hast_core=debug";

/// Install a test-writer subscriber once per process. `RUST_LOG` replaces
/// [`DEFAULT_FILTER`]; later calls do nothing.
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(false)
        .try_init();
}
