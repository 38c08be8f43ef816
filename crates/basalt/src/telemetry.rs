//! Tracing subscriber setup.

use basalt_config::{ConfigError, LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{BasaltError, Result};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.filter`. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| {
            ConfigError::ValidationError(format!(
                "invalid logging.filter '{}': {e}",
                config.filter
            ))
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    installed.map_err(|e| BasaltError::internal(format!("tracing already initialized: {e}")))
}
