//! Structured logging

use tracing_subscriber::EnvFilter;

use crate::{
    config::ProbeConfig,
    error::{Error, Result},
};

/// Install a global JSON subscriber filtered by `config.log_level`
///
/// `RUST_LOG` is ignored; use the `POD_LIFECYCLE_LOG_LEVEL` variable instead.
/// An unparsable level falls back to `info`. Fails when a global subscriber
/// is already installed.
pub fn init_tracing(config: &ProbeConfig) -> Result<()> {
    let log_level = config.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .map_err(|err| Error::Tracing(err.to_string()))?;

    tracing::info!(
        mechanism = %config.mechanism,
        log_level = %log_level,
        "Tracing initialized"
    );

    Ok(())
}
