//! Broker configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HopperError, Result};

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Address to listen on, e.g. `0.0.0.0:8080`
    pub addr: String,
    /// Prefix for URL paths; must begin and end with `/`
    pub path_prefix: String,
    /// Username for basic auth (auth disabled when both are empty)
    pub auth_username: String,
    /// Password for basic auth
    pub auth_password: String,
    /// Snapshot file path; enables loading at start and periodic saves
    pub save_path: Option<PathBuf>,
    /// Time between periodic saves
    pub save_interval: Duration,
    /// Default timeout of individual tasks
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            path_prefix: "/".to_string(),
            auth_username: String::new(),
            auth_password: String::new(),
            save_path: None,
            save_interval: Duration::from_secs(300),
            timeout: Duration::from_secs(900),
        }
    }
}

impl Config {
    /// Checks the cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !self.path_prefix.starts_with('/') || !self.path_prefix.ends_with('/') {
            return Err(HopperError::Config(
                "path prefix must start and end with a '/' character".to_string(),
            ));
        }
        if self.save_interval.is_zero() {
            return Err(HopperError::Config(
                "save interval must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Basic auth is enforced unless both credential fields are empty.
    pub fn auth_enabled(&self) -> bool {
        !self.auth_username.is_empty() || !self.auth_password.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.auth_enabled());
        assert_eq!(config.timeout, Duration::from_secs(900));
    }

    #[test]
    fn test_path_prefix_validation() {
        let mut config = Config {
            path_prefix: "/queues/".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        config.path_prefix = "queues/".to_string();
        assert!(config.validate().is_err());

        config.path_prefix = "/queues".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_enabled_with_either_field() {
        let mut config = Config::default();
        assert!(!config.auth_enabled());

        config.auth_username = "admin".to_string();
        assert!(config.auth_enabled());

        config.auth_username.clear();
        config.auth_password = "secret".to_string();
        assert!(config.auth_enabled());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            save_path: Some(PathBuf::from("/var/lib/hopper/state.zip")),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
