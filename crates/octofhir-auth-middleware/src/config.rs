//! Middleware configuration.
//!
//! # Example (TOML)
//!
//! ```toml
//! require_auth = true
//! skip_paths = ["/health", "/metadata", "/.well-known/*"]
//! allow_anonymous = false
//! cache_results = true
//! max_cache_size = 1000
//! cache_ttl = "5s"
//! audit_level = "detailed"
//! default_policy = "allow"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default capacity of the authentication cache.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

/// Default time-to-live of an authentication cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(5000);

/// Authentication middleware configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Authenticate requests when neither `skip_paths` nor `only_paths`
    /// is configured.
    pub require_auth: bool,

    /// Glob patterns of paths exempt from authentication.
    pub skip_paths: Vec<String>,

    /// Glob patterns of the only paths that require authentication.
    /// Takes priority over `skip_paths` when non-empty.
    pub only_paths: Vec<String>,

    /// Let requests with failed authentication proceed as anonymous.
    pub allow_anonymous: bool,

    /// Cache authentication results by credential fingerprint.
    pub cache_results: bool,

    /// Maximum number of cached authentication results.
    pub max_cache_size: usize,

    /// How long a cached authentication result stays valid.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Emit authentication audit events.
    pub audit_enabled: bool,

    /// Amount of request detail attached to audit events.
    pub audit_level: AuditLevel,

    /// Realm advertised in `WWW-Authenticate` challenges.
    pub realm: String,

    /// Decision taken by permission checks that no rule covers.
    pub default_policy: DefaultPolicy,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            require_auth: true,
            skip_paths: Vec::new(),
            only_paths: Vec::new(),
            allow_anonymous: false,
            cache_results: true,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            audit_enabled: true,
            audit_level: AuditLevel::Detailed,
            realm: "octofhir".to_string(),
            default_policy: DefaultPolicy::Allow,
        }
    }
}

/// Amount of detail recorded in audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Outcome, user and strategy only.
    Minimal,
    /// Additionally method, path, client address, user agent and timings.
    #[default]
    Detailed,
}

/// Fallthrough decision for permission checks.
///
/// `Allow` grants access unless a rule explicitly denies it. `Deny` only
/// grants access that a rule explicitly allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    /// Grant unless explicitly denied.
    #[default]
    Allow,
    /// Deny unless explicitly granted.
    Deny,
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// The configuration could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl MiddlewareConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - Caching is enabled with a zero capacity or zero TTL
    /// - The realm is empty or contains a double quote
    /// - A path pattern is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_results {
            if self.max_cache_size == 0 {
                return Err(ConfigError::InvalidValue(
                    "max_cache_size must be > 0 when cache_results is enabled".to_string(),
                ));
            }
            if self.cache_ttl.is_zero() {
                return Err(ConfigError::InvalidValue(
                    "cache_ttl must be > 0 when cache_results is enabled".to_string(),
                ));
            }
        }

        if self.realm.is_empty() || self.realm.contains('"') {
            return Err(ConfigError::InvalidValue(format!(
                "Invalid realm: '{}'. Must be non-empty and must not contain quotes",
                self.realm
            )));
        }

        if let Some(pattern) = self
            .skip_paths
            .iter()
            .chain(&self.only_paths)
            .find(|p| p.is_empty())
        {
            return Err(ConfigError::InvalidValue(format!(
                "Path patterns cannot be empty: '{}'",
                pattern
            )));
        }

        Ok(())
    }
}

pub mod loader {
    //! Loads [`MiddlewareConfig`] from TOML with environment overrides.

    use std::path::Path;

    use config::{Config, Environment, File, FileFormat};

    use super::{ConfigError, MiddlewareConfig};

    /// Environment variable prefix, e.g. `OCTOFHIR_AUTH__REQUIRE_AUTH=false`.
    pub const ENV_PREFIX: &str = "OCTOFHIR_AUTH";

    /// Loads the configuration from an optional TOML file, applies
    /// environment overrides and validates the result.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load_config(path: Option<&Path>) -> Result<MiddlewareConfig, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path
            && path.exists()
        {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("skip_paths")
                .with_list_parse_key("only_paths"),
        );
        finish(builder)
    }

    /// Parses the configuration from a TOML string and validates it.
    pub fn from_toml_str(source: &str) -> Result<MiddlewareConfig, ConfigError> {
        finish(Config::builder().add_source(File::from_str(source, FileFormat::Toml)))
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<MiddlewareConfig, ConfigError> {
        let merged: MiddlewareConfig = builder
            .build()
            .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}
