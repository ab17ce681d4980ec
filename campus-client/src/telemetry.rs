//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ClientError, ClientResult};

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `config.filter`. Returns `Ok(false)` when a
/// subscriber was already installed, so repeated calls are harmless.
pub fn init_tracing(config: &LoggingConfig) -> ClientResult<bool> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| ClientError::Telemetry(format!("invalid filter: {e}")))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init().is_ok()
    };

    if installed {
        tracing::info!(filter = %config.filter, json = config.json, "Tracing initialized");
    }
    Ok(installed)
}
