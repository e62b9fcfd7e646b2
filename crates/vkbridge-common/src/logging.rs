use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set VKBRIDGE_LOG=debug (or trace, info, warn, error) for verbosity control.
///
/// The layer is loaded into arbitrary host processes, some of which may
/// already have a global subscriber installed, so `try_init` is used and
/// a second initialization is a no-op.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("VKBRIDGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();
}
