//! Logging setup for the launcher binary

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable holding an `EnvFilter` directive
pub const LOG_ENV: &str = "LAUNCHPAD_LOG";

/// Build the filter: `--debug` wins, then `LAUNCHPAD_LOG`, then `info`
pub fn filter(debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new(Level::DEBUG.as_str());
    }

    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str()))
}

/// Install the global subscriber
pub fn init(debug: bool) -> Result<()> {
    // Log to stderr so `list --json` output stays clean on stdout
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter(debug))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")
}
