//! Centralized error types for Nimbus.
//!
//! This module provides a typed error hierarchy that:
//! - Separates reported persistence failures from absorbed cache failures
//! - Provides user-friendly messages suitable for UI display
//! - Preserves full error context for debugging/logging

use std::time::Duration;

use thiserror::Error;

/// Top-level application error type.
///
/// Use `user_message()` to get a UI-appropriate message.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Returns a user-friendly message suitable for display in the UI.
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::Store(e) => e.user_message(),
            AppError::Config(e) => e.user_message(),
            AppError::Io(_) => "A file operation failed. Please try again.",
            AppError::Other(_) => "An unexpected error occurred. Please try again.",
        }
    }
}

/// Errors reported by the history and preference stores.
///
/// The icon cache never produces these: its failures degrade to a cache miss.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Timed out after {waited_ms}ms waiting for store lock ({operation})")]
    Timeout {
        operation: &'static str,
        waited_ms: u64,
    },

    #[error("Observation id already stored: {0}")]
    DuplicateId(String),

    #[error("Failed to open store: {0}")]
    Open(String),
}

impl StoreError {
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn timeout(operation: &'static str, waited: Duration) -> Self {
        Self::Timeout {
            operation,
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// True for the timeout kind, which callers may choose to retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            StoreError::Persistence(_) => "Your data could not be saved. Please try again.",
            StoreError::Timeout { .. } => "Local storage is busy. Please try again.",
            StoreError::DuplicateId(_) => "This entry is already saved.",
            StoreError::Open(_) => "Unable to access local data. Try restarting the app.",
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::NotFound(_) => "Configuration not found. Using defaults.",
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::ParseError(_) => "Configuration file is malformed. Check your settings.",
        }
    }
}

/// Extension trait for converting rusqlite errors to our error types.
pub trait RusqliteErrorExt {
    fn into_store_error(self) -> StoreError;
}

impl RusqliteErrorExt for rusqlite::Error {
    fn into_store_error(self) -> StoreError {
        match &self {
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("corrupt") => {
                StoreError::Persistence(format!("database corrupt: {}", self))
            }
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::CannotOpen =>
            {
                StoreError::Open(self.to_string())
            }
            _ => StoreError::Persistence(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_conversion() {
        let app_err: AppError = StoreError::persistence("disk full").into();
        assert!(matches!(app_err, AppError::Store(StoreError::Persistence(_))));
    }

    #[test]
    fn test_user_message_propagation() {
        let app_err = AppError::Store(StoreError::timeout("insert", Duration::from_millis(50)));
        assert_eq!(app_err.user_message(), "Local storage is busy. Please try again.");
    }

    #[test]
    fn test_timeout_is_distinguishable() {
        let err = StoreError::timeout("delete_all", Duration::from_millis(50));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("50ms"));
        assert!(!StoreError::persistence("x").is_timeout());
    }

    #[test]
    fn test_rusqlite_error_maps_to_persistence() {
        let err = rusqlite::Error::QueryReturnedNoRows.into_store_error();
        assert!(matches!(err, StoreError::Persistence(_)));
    }
}
