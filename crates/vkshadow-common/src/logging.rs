use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "VKSHADOW_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with environment filter.
/// Set VKSHADOW_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but returns `false` instead of panicking when a
/// global subscriber is already installed. Tests call this once per binary.
pub fn try_init_logging() -> bool {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .with_test_writer()
        .try_init()
        .is_ok()
}
