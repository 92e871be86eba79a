//! ABOUTME: Logging infrastructure for QType
//! ABOUTME: Provides opt-in tracing initialization with env-filter support

use tracing_subscriber::EnvFilter;

/// Initialize structured logging with an explicit filter directive.
///
/// Library code never initializes logging on its own; embedding hosts call
/// this once at startup. Returns an error if a global subscriber is already
/// installed.
pub fn init_logging(filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(filter)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()?;
    Ok(())
}

/// Initialize logging from the `QTYPE_LOG` environment variable, defaulting
/// to `warn` when unset.
pub fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = std::env::var("QTYPE_LOG").unwrap_or_else(|_| "warn".to_string());
    init_logging(&filter)
}
