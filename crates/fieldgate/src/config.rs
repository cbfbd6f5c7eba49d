//! Authorizer configuration.
//!
//! [`AuthorizerConfig`] describes a complete authorizer: the site, where its
//! data and module come from, the refresh interval and the QuickJS limits.
//! It is loaded from TOML with `FIELDGATE__*` environment overrides.
//!
//! # Example (TOML)
//!
//! ```toml
//! site = "example.com"
//! interval = "1m"
//! startup_timeout = "30s"
//!
//! [data]
//! source = "url"
//! url = "https://policy.example.com/data.json"
//!
//! [module]
//! source = "file"
//! path = "policy/module.js"
//!
//! [quickjs]
//! timeout_ms = 100
//! pool_size = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DataMap;

/// Default refresh interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Prefix for environment overrides, e.g. `FIELDGATE__INTERVAL=30s`.
pub const ENV_PREFIX: &str = "FIELDGATE";

// =============================================================================
// Authorizer Configuration
// =============================================================================

/// Root configuration for one authorizer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthorizerConfig {
    /// Site whose policy is served.
    pub site: String,

    /// Refresh period.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on how long an access check waits for the first
    /// successful refresh. `None` waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Option<Duration>,

    /// Reference data source.
    pub data: DataSourceConfig,

    /// Rule module source.
    pub module: ModuleSourceConfig,

    /// QuickJS engine limits.
    pub quickjs: QuickJsConfig,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            site: String::new(),
            interval: DEFAULT_INTERVAL,
            startup_timeout: None,
            data: DataSourceConfig::default(),
            module: ModuleSourceConfig::default(),
            quickjs: QuickJsConfig::default(),
        }
    }
}

/// Where reference data comes from.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum DataSourceConfig {
    /// Empty data.
    #[default]
    None,
    /// Data embedded in the configuration.
    Inline {
        /// The data mapping.
        value: DataMap,
    },
    /// JSON document fetched once at startup.
    Url {
        /// Document URL.
        url: String,
    },
    /// JSON file re-read every cycle.
    File {
        /// File path.
        path: PathBuf,
    },
}

/// Where the rule module comes from.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ModuleSourceConfig {
    /// Empty module.
    #[default]
    None,
    /// Module text embedded in the configuration.
    Inline {
        /// The module text.
        text: String,
    },
    /// Module file re-read every cycle.
    File {
        /// File path.
        path: PathBuf,
    },
}

/// QuickJS scripting engine configuration.
///
/// Controls resource limits for compiled policy queries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QuickJsConfig {
    /// Memory limit per runtime in megabytes.
    pub memory_limit_mb: usize,

    /// Stack size limit in kilobytes.
    pub max_stack_size_kb: usize,

    /// Evaluation timeout in milliseconds, also applied to module loading.
    pub timeout_ms: u64,

    /// Runtimes per compiled query.
    /// More runtimes allow more parallel evaluations.
    pub pool_size: usize,
}

impl Default for QuickJsConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 16,
            max_stack_size_kb: 256,
            timeout_ms: 100,
            pool_size: num_cpus::get().max(1),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The configuration sources could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

// =============================================================================
// Loading and Validation
// =============================================================================

impl AuthorizerConfig {
    /// Configuration for `site` with every other value defaulted.
    #[must_use]
    pub fn for_site(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional TOML file plus environment
    /// overrides (`FIELDGATE__SITE`, `FIELDGATE__QUICKJS__POOL_SIZE`, ...),
    /// then validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not deserialize, or
    /// fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        use config::{Config, Environment, File};

        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Load(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );

        let merged: Self = builder
            .build()
            .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;

        merged.validate()?;
        Ok(merged)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the site or a source location is
    /// empty, and `ConfigError::InvalidValue` if:
    /// - The interval or startup timeout is zero
    /// - A URL source is not a valid URL
    /// - A QuickJS limit is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.site.trim().is_empty() {
            return Err(ConfigError::Missing("site".to_string()));
        }

        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "interval must be greater than zero".to_string(),
            ));
        }

        if self.startup_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidValue(
                "startup_timeout must be greater than zero when set".to_string(),
            ));
        }

        match &self.data {
            DataSourceConfig::Url { url } if url.trim().is_empty() => {
                return Err(ConfigError::Missing("data.url".to_string()));
            }
            DataSourceConfig::Url { url } => {
                url::Url::parse(url).map_err(|e| {
                    ConfigError::InvalidValue(format!("data.url '{url}' is not a valid URL: {e}"))
                })?;
            }
            DataSourceConfig::File { path } if path.as_os_str().is_empty() => {
                return Err(ConfigError::Missing("data.path".to_string()));
            }
            _ => {}
        }

        if let ModuleSourceConfig::File { path } = &self.module
            && path.as_os_str().is_empty()
        {
            return Err(ConfigError::Missing("module.path".to_string()));
        }

        self.quickjs.validate()
    }
}

impl QuickJsConfig {
    /// Validates the engine limits.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::InvalidValue(
                "quickjs.memory_limit_mb must be > 0".to_string(),
            ));
        }
        if self.max_stack_size_kb == 0 {
            return Err(ConfigError::InvalidValue(
                "quickjs.max_stack_size_kb must be > 0".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "quickjs.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue(
                "quickjs.pool_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
