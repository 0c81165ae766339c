use tracing_subscriber::EnvFilter;

/// Installs a console subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Output goes to stderr; the host owns the client's stdout. Calling this more
/// than once, or after another subscriber was installed, does nothing.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
