//! Logging initialization.
//!
//! `RUST_LOG` wins when set; otherwise the configured log level applies.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter used by [`init`].
pub fn filter(log_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level '{}'", log_level)),
    }
}

/// Install the global tracing subscriber: env filter plus a fmt layer.
pub fn init(log_level: &str) -> Result<()> {
    let env_filter = filter(log_level)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(log_level, "Logging initialized");
    Ok(())
}
