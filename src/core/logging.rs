//! Tracing bootstrap.

use tracing::Level;

/// Install a fmt subscriber at the given level.
///
/// Safe to call more than once; later calls are ignored, which keeps
/// test binaries from fighting over the global dispatcher.
pub fn init_tracing(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}

/// Subscriber for unit tests: debug level, captured by the test harness.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}
