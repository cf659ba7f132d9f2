//! Structured logging setup
//!
//! Installs a `tracing-subscriber` formatter driven by [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level when set.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{GatewayError, Result};

/// Install the global tracing subscriber
///
/// Fails if a subscriber has already been installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_ascii_lowercase()));

    let builder = fmt().with_env_filter(filter).with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| GatewayError::Config(format!("Failed to install logger: {e}")))
}
