//! Logging setup for the CLI binary.

use tracing_subscriber::EnvFilter;

/// Initialize tracing to stderr, honoring `RUST_LOG` and defaulting to
/// `info`. Logs go to stderr so stdout stays reserved for structured
/// command output.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
