use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::ConfigError;

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8090";

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

/// Tunables for the activation engine's administrative and maintenance paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationSettings {
    /// Age after which disabled rules and audit records are purged.
    pub audit_retention_days: u32,
    /// Upper bound on rows touched by a single maintenance batch.
    pub maintenance_batch_size: usize,
    /// Capacity of the bounded channel feeding the external audit sink.
    pub audit_channel_capacity: usize,
    /// Seconds between reloads of the rule cache from the repository; 0 turns reloading off.
    pub cache_refresh_secs: u64,
    /// Optional YAML/JSON file or directory of rules applied at startup.
    pub rules_seed: Option<PathBuf>,
}

impl Default for ActivationSettings {
    fn default() -> Self {
        Self {
            audit_retention_days: 90,
            maintenance_batch_size: 500,
            audit_channel_capacity: 1024,
            cache_refresh_secs: 30,
            rules_seed: None,
        }
    }
}

/// Global configuration for the Beacon service.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Postgres URL. When absent the in-memory backends are used.
    pub database_url: Option<String>,
    pub environment: Environment,
    pub node_name: String,
    pub http_bind: String,
    pub activation: ActivationSettings,
}

impl CoreConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_prefix("BEACON_")
    }

    /// Loads configuration from env vars prefixed with the provided value (e.g. `BEACON_`).
    ///
    /// `DATABASE_URL` is also honoured without the prefix.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let key = |suffix: &str| format!("{}{}", prefix, suffix);

        let database_url = env::var(key("DATABASE_URL"))
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .filter(|value| !value.trim().is_empty());

        let environment = env::var(key("ENV"))
            .map(|raw| Environment::parse(&raw))
            .unwrap_or_default();

        let node_name = env::var(key("NODE_NAME")).unwrap_or_else(|_| "beacon-node".to_string());
        let http_bind =
            env::var(key("HTTP_BIND")).unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string());

        let defaults = ActivationSettings::default();
        let activation = ActivationSettings {
            audit_retention_days: parse_var(&key("AUDIT_RETENTION_DAYS"))?
                .unwrap_or(defaults.audit_retention_days),
            maintenance_batch_size: parse_var(&key("MAINTENANCE_BATCH"))?
                .unwrap_or(defaults.maintenance_batch_size),
            audit_channel_capacity: parse_var(&key("AUDIT_CHANNEL"))?
                .unwrap_or(defaults.audit_channel_capacity),
            cache_refresh_secs: parse_var(&key("CACHE_REFRESH_SECS"))?
                .unwrap_or(defaults.cache_refresh_secs),
            rules_seed: env::var(key("RULES_SEED")).ok().map(PathBuf::from),
        };

        if activation.maintenance_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: key("MAINTENANCE_BATCH"),
                value: "0".into(),
                reason: "batch size must be positive".into(),
            });
        }

        Ok(Self {
            database_url,
            environment,
            node_name,
            http_bind,
            activation,
        })
    }

    /// Returns the Postgres URL when persistence is configured.
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    /// Whether the service is running in production.
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }
}

fn parse_var<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: err.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Distinct prefixes keep these tests independent of each other's env vars.

    #[test]
    fn falls_back_to_defaults() {
        let cfg = CoreConfig::from_env_with_prefix("BEACON_TEST_DEFAULTS_").expect("config");
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.http_bind, DEFAULT_HTTP_BIND);
        assert_eq!(cfg.activation, ActivationSettings::default());
    }

    #[test]
    fn reads_activation_settings() {
        std::env::set_var("BEACON_TEST_READS_AUDIT_RETENTION_DAYS", "30");
        std::env::set_var("BEACON_TEST_READS_MAINTENANCE_BATCH", "50");
        std::env::set_var("BEACON_TEST_READS_CACHE_REFRESH_SECS", "0");
        std::env::set_var("BEACON_TEST_READS_ENV", "prod");
        let cfg = CoreConfig::from_env_with_prefix("BEACON_TEST_READS_").expect("config");
        assert_eq!(cfg.activation.audit_retention_days, 30);
        assert_eq!(cfg.activation.maintenance_batch_size, 50);
        assert_eq!(cfg.activation.cache_refresh_secs, 0);
        assert!(cfg.is_production());
    }

    #[test]
    fn rejects_malformed_numbers() {
        std::env::set_var("BEACON_TEST_BAD_AUDIT_RETENTION_DAYS", "ninety");
        let err = CoreConfig::from_env_with_prefix("BEACON_TEST_BAD_").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
