pub mod config;
pub mod error;

pub use crate::config::{
    CacheConfig, HistoryConfig, LoggingConfig, NimbusConfig, StorageConfig, TemperatureUnit,
    ValidationResult,
};
pub use crate::error::{AppError, ConfigError, RusqliteErrorExt, StoreError};

use anyhow::Result;

/// Initialize logging.
///
/// `RUST_LOG` wins over `default_filter`. Safe to call more than once.
pub fn init(default_filter: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Nimbus core initialized");
    }
    Ok(())
}
