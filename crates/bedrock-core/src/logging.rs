//! Diagnostic logging setup shared by the workspace binaries.

use tracing_subscriber::EnvFilter;

/// Initialize tracing for a binary.  The filter comes from `BEDROCK_LOG`
/// when set, falling back to the provided default directive.
pub fn init_logging(default: &str) {
    let filter =
        EnvFilter::try_from_env("BEDROCK_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
