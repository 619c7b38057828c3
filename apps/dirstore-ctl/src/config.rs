//! Configuration loaded from the environment.

use std::env;
use std::fmt;
use std::str::FromStr;

use dirstore_core::{MatchingRule, MatchingRules};
use dirstore_db::PoolSettings;
use thiserror::Error;

/// Configuration errors that can occur during environment loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("expected 'json' or 'pretty', got '{other}'")),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub pool: PoolSettings,
    pub log_format: LogFormat,
    pub rust_log: String,
    /// Attributes compared case-sensitively, in addition to the built-ins.
    pub case_exact_attributes: Vec<String>,
    /// Attributes holding DNs, in addition to the built-ins.
    pub dn_attributes: Vec<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("pool", &self.pool)
            .field("log_format", &self.log_format)
            .field("rust_log", &self.rust_log)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `DATABASE_URL` is missing or a value does
    /// not parse.
    ///
    /// # Required Variables
    ///
    /// - `DATABASE_URL` - PostgreSQL connection string
    ///
    /// # Optional Variables
    ///
    /// - `RUST_LOG` - Log level filter (default: "info")
    /// - `DIRSTORE_LOG_FORMAT` - `json` or `pretty` (default: `json`)
    /// - `DIRSTORE_MAX_CONNECTIONS` - Pool size (default: 10)
    /// - `DIRSTORE_ACQUIRE_TIMEOUT_SECS` - Pool acquire timeout (default: 5)
    /// - `DIRSTORE_CASE_EXACT_ATTRIBUTES` - Comma-separated attribute names
    /// - `DIRSTORE_DN_ATTRIBUTES` - Comma-separated attribute names
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development only)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let defaults = PoolSettings::default();
        let pool = PoolSettings {
            max_connections: parse_or(&lookup, "DIRSTORE_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout_secs: parse_or(
                &lookup,
                "DIRSTORE_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout_secs,
            )?,
        };
        if pool.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                var: "DIRSTORE_MAX_CONNECTIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            database_url,
            pool,
            log_format: parse_or(&lookup, "DIRSTORE_LOG_FORMAT", LogFormat::default())?,
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            case_exact_attributes: split_list(lookup("DIRSTORE_CASE_EXACT_ATTRIBUTES")),
            dn_attributes: split_list(lookup("DIRSTORE_DN_ATTRIBUTES")),
        })
    }

    /// Built-in matching rules extended with the configured attributes.
    #[must_use]
    pub fn matching_rules(&self) -> MatchingRules {
        let rules = self
            .case_exact_attributes
            .iter()
            .fold(MatchingRules::new(), |rules, name| {
                rules.with_rule(name, MatchingRule::CaseExact)
            });
        self.dn_attributes.iter().fold(rules, |rules, name| {
            rules.with_rule(name, MatchingRule::DistinguishedName)
        })
    }
}

fn parse_or<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            message: err.to_string(),
        }),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
