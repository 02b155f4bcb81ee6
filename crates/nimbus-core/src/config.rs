use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, ConfigError};

/// Environment variable prefix for overrides, e.g. `NIMBUS__CACHE__MAX_AGE_DAYS=1`.
pub const ENV_PREFIX: &str = "NIMBUS";

const APP_DIR_NAME: &str = "nimbus";
const HISTORY_DB_FILE: &str = "history.sqlite3";
const PREFERENCES_DB_FILE: &str = "preferences.sqlite3";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Temperature unit preference. Observations are always stored in Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    pub const ALL: [TemperatureUnit; 2] = [TemperatureUnit::Celsius, TemperatureUnit::Fahrenheit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Celsius => "celsius",
            Self::Fahrenheit => "fahrenheit",
        }
    }

    /// Display label, as shown in the settings picker.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Celsius => "Celsius",
            Self::Fahrenheit => "Fahrenheit",
        }
    }
}

impl FromStr for TemperatureUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|unit| {
                let name = unit.as_str();
                name == wanted || (wanted.len() == 1 && name.starts_with(wanted.as_str()))
            })
            .ok_or_else(|| {
                format!(
                    "unknown temperature unit: {} (expected {})",
                    wanted,
                    Self::ALL.map(|unit| unit.as_str()).join(" or ")
                )
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NimbusConfig {
    /// Where the stores live on disk
    #[serde(default)]
    pub storage: StorageConfig,

    /// Icon cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// History settings
    #[serde(default)]
    pub history: HistoryConfig,

    /// Log filter used when RUST_LOG is unset
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the history and preference databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Parent directory of the icon cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Upper bound on waiting for a store lock before failing with a timeout
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join(APP_DIR_NAME)
}

fn default_lock_timeout_ms() -> u64 {
    50
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_dir: default_cache_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Name of the icon directory under `storage.cache_dir`
    #[serde(default = "default_cache_directory_name")]
    pub directory_name: String,

    /// Entries older than this are treated as absent
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_cache_directory_name() -> String {
    "WeatherIcons".to_string()
}

fn default_max_age_days() -> u32 {
    7
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory_name: default_cache_directory_name(),
            max_age_days: default_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_limit")]
    pub default_limit: usize,
}

fn default_history_limit() -> usize {
    50
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NimbusConfig {
    /// Load configuration from `path`, layering `NIMBUS__*` environment overrides on top.
    ///
    /// A missing file is created with defaults first.
    pub fn load_from(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            Self::default().save_to(path)?;
            tracing::info!("Created default config at {}", path.display());
        }

        let layered = ::config::Config::builder()
            .add_source(
                ::config::File::from(path.to_path_buf())
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        let config: NimbusConfig = layered
            .try_deserialize()
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Fails with `ConfigError::Invalid` on any validation error. Warnings are
    /// returned for the caller to report once logging is set up.
    pub fn load_validated(path: &Path) -> Result<(Self, ValidationResult), AppError> {
        let config = Self::load_from(path)?;
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()).into());
        }

        Ok((config, validation))
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.cache.max_age_days == 0 {
            result.add_error("cache.max_age_days", "Cache max age must be at least one day");
        } else if self.cache.max_age_days > 365 {
            result.add_warning("cache.max_age_days", "Cache max age is more than a year");
        }

        if !is_single_component(&self.cache.directory_name) {
            result.add_error(
                "cache.directory_name",
                format!(
                    "Must be a single directory name, got: {:?}",
                    self.cache.directory_name
                ),
            );
        }

        if self.storage.lock_timeout_ms == 0 {
            result.add_error("storage.lock_timeout_ms", "Lock timeout must be greater than 0");
        } else if self.storage.lock_timeout_ms > 1000 {
            result.add_warning(
                "storage.lock_timeout_ms",
                "Lock timeout above one second will hide disk stalls",
            );
        }

        if self.history.default_limit == 0 {
            result.add_error("history.default_limit", "History limit must be greater than 0");
        }

        result
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ConfigError::NotFound("platform config directory".to_string()))?
            .join(APP_DIR_NAME);

        Ok(config_dir.join("config.toml"))
    }

    pub fn icon_cache_dir(&self) -> PathBuf {
        self.storage.cache_dir.join(&self.cache.directory_name)
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.storage.data_dir.join(HISTORY_DB_FILE)
    }

    pub fn preferences_db_path(&self) -> PathBuf {
        self.storage.data_dir.join(PREFERENCES_DB_FILE)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache.max_age_days) * SECONDS_PER_DAY)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.lock_timeout_ms)
    }
}

fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_valid_default_config() {
        let config = NimbusConfig::default();
        let result = config.validate();
        assert!(result.is_valid(), "Default config should be valid: {:?}", result.errors);
        assert_eq!(config.cache_ttl(), Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.history.default_limit, 50);
    }

    #[test]
    fn test_zero_max_age_is_error() {
        let mut config = NimbusConfig::default();
        config.cache.max_age_days = 0;
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.field == "cache.max_age_days"));
    }

    #[test]
    fn test_directory_name_must_be_single_component() {
        let mut config = NimbusConfig::default();
        for bad in ["", "..", "a/b", "/abs"] {
            config.cache.directory_name = bad.to_string();
            let result = config.validate();
            assert!(
                result.errors.iter().any(|e| e.field == "cache.directory_name"),
                "expected error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_long_lock_timeout_is_warning() {
        let mut config = NimbusConfig::default();
        config.storage.lock_timeout_ms = 5_000;
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.field == "storage.lock_timeout_ms"));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = NimbusConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.cache.directory_name, "WeatherIcons");
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nmax_age_days = 2\n").unwrap();

        let config = NimbusConfig::load_from(&path).unwrap();
        assert_eq!(config.cache.max_age_days, 2);
        assert_eq!(config.cache.directory_name, "WeatherIcons");
        assert_eq!(config.storage.lock_timeout_ms, 50);
    }

    #[test]
    fn test_load_validated_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[history]\ndefault_limit = 0\n").unwrap();

        let err = NimbusConfig::load_validated(&path).unwrap_err();
        assert!(matches!(
            err,
            AppError::Config(ConfigError::Invalid(ref m)) if m.contains("history.default_limit")
        ));
    }

    #[test]
    fn test_load_validated_returns_warnings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[storage]\nlock_timeout_ms = 5000\n").unwrap();

        let (config, validation) = NimbusConfig::load_validated(&path).unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(validation.warnings.len(), 1);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache\nmax_age_days = ").unwrap();

        let err = NimbusConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, AppError::Config(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_save_into_file_path_is_io_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let err = NimbusConfig::default()
            .save_to(&blocker.join("config.toml"))
            .unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
    }

    #[test]
    fn test_derived_paths() {
        let mut config = NimbusConfig::default();
        config.storage.data_dir = PathBuf::from("/data");
        config.storage.cache_dir = PathBuf::from("/cache");
        assert_eq!(config.icon_cache_dir(), PathBuf::from("/cache/WeatherIcons"));
        assert_eq!(config.history_db_path(), PathBuf::from("/data/history.sqlite3"));
        assert_eq!(config.preferences_db_path(), PathBuf::from("/data/preferences.sqlite3"));
    }

    #[test]
    fn test_temperature_unit_parse() {
        assert_eq!("Celsius".parse::<TemperatureUnit>(), Ok(TemperatureUnit::Celsius));
        assert_eq!("f".parse::<TemperatureUnit>(), Ok(TemperatureUnit::Fahrenheit));
        assert!("kelvin"
            .parse::<TemperatureUnit>()
            .unwrap_err()
            .contains("celsius or fahrenheit"));
        assert!("".parse::<TemperatureUnit>().is_err());
        assert_eq!(TemperatureUnit::default(), TemperatureUnit::Celsius);
    }

    #[test]
    fn test_validation_result_error_summary() {
        let mut result = ValidationResult::default();
        result.add_error("field1", "error1");
        result.add_error("field2", "error2");
        let summary = result.error_summary();
        assert!(summary.contains("field1"));
        assert!(summary.contains("field2"));
    }
}
