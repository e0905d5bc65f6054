//! Server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("max_top must be greater than zero")]
    ZeroMaxTop,

    #[error("database url is empty")]
    MissingDatabaseUrl,

    #[error("min_connections ({min}) exceeds max_connections ({max})")]
    PoolBounds { min: u32, max: u32 },

    #[error("external_uri '{0}' is not an absolute URL")]
    InvalidExternalUri(String),
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public root URL; self links and next links are built on it
    #[serde(default = "default_external_uri")]
    pub external_uri: String,
    /// Largest page a request may ask for
    #[serde(default = "default_max_top")]
    pub max_top: u64,
    /// Storage namespace for every table
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    pub database: DatabaseConfig,
}

fn default_external_uri() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_top() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

impl ServerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            external_uri: default_external_uri(),
            max_top: default_max_top(),
            schema: None,
            request_timeout_ms: default_request_timeout_ms(),
            database: DatabaseConfig {
                url: database_url.into(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
            },
        }
    }

    /// Checks bounds and normalizes `external_uri` (no trailing `/`).
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.max_top == 0 {
            return Err(ConfigError::ZeroMaxTop);
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::PoolBounds {
                min: self.database.min_connections,
                max: self.database.max_connections,
            });
        }
        if url::Url::parse(&self.external_uri).is_err() {
            return Err(ConfigError::InvalidExternalUri(self.external_uri));
        }
        self.external_uri = self.external_uri.trim_end_matches('/').to_string();
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"database": {"url": "postgres://localhost/st"}}"#).unwrap();
        assert_eq!(config.max_top, 100);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.min_connections, 1);
        assert_eq!(config.external_uri, "http://localhost:8080");
        assert!(config.schema.is_none());
    }

    #[test]
    fn test_validate_trims_external_uri() {
        let mut config = ServerConfig::new("postgres://localhost/st");
        config.external_uri = "https://sensors.example.org/".to_string();
        let config = config.validate().unwrap();
        assert_eq!(config.external_uri, "https://sensors.example.org");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::new("postgres://localhost/st");
        config.max_top = 0;
        assert_eq!(config.validate().unwrap_err(), ConfigError::ZeroMaxTop);

        let config = ServerConfig::new("  ");
        assert_eq!(config.validate().unwrap_err(), ConfigError::MissingDatabaseUrl);

        let mut config = ServerConfig::new("postgres://localhost/st");
        config.database.min_connections = 20;
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::PoolBounds { min: 20, max: 10 }
        );

        let mut config = ServerConfig::new("postgres://localhost/st");
        config.external_uri = "not a url".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidExternalUri(_)
        ));
    }

    #[test]
    fn test_request_timeout() {
        let mut config = ServerConfig::new("postgres://localhost/st");
        config.request_timeout_ms = 1500;
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
    }
}
