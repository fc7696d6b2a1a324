use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that controls log verbosity.
pub const LOG_ENV: &str = "VKREPLAY_LOG";

/// Initialize structured logging with environment filter.
/// Set VKREPLAY_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but safe to call more than once (tests call it per case).
pub fn try_init_test_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
