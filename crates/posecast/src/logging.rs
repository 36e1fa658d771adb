use tracing_subscriber::EnvFilter;

/// Initialize compact stderr logging filtered by `RUST_LOG` (default `info`).
/// Idempotent: a second call leaves the existing subscriber in place.
pub fn init() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_target(false)
    .try_init();
}
