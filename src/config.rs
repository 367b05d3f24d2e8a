//! Daemon configuration.
//!
//! Loaded from a YAML file. Only the endpoint path is mandatory; the table
//! ceilings default to values suitable for a single-host deployment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::worker::{WorkerConfig, DEFAULT_MAX_CLIENTS, DEFAULT_MAX_SESSIONS};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem path of the pipe endpoint to serve.
    pub endpoint: PathBuf,
    /// Ceiling on concurrently connected logical clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Ceiling on concurrently live SOCKS sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config: {0}")]
    Invalid(String),
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("endpoint path is empty".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be positive".into()));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be positive".into()));
        }
        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            endpoint: self.endpoint.clone(),
            max_clients: self.max_clients,
            max_sessions: self.max_sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("endpoint: /run/sockspipe.sock").unwrap();
        config.validate().unwrap();
        assert_eq!(config.endpoint, PathBuf::from("/run/sockspipe.sock"));
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn test_explicit_ceilings() {
        let config: Config = serde_yaml::from_str(
            "endpoint: /tmp/x.sock\nmax_clients: 16\nmax_sessions: 32\n",
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_clients, 16);
        assert_eq!(config.max_sessions, 32);
    }

    #[test]
    fn test_zero_ceiling_is_rejected() {
        let config: Config =
            serde_yaml::from_str("endpoint: /tmp/x.sock\nmax_clients: 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_endpoint_is_rejected() {
        let config: Config = serde_yaml::from_str("endpoint: \"\"").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_endpoint_fails_parse() {
        assert!(serde_yaml::from_str::<Config>("max_clients: 4").is_err());
    }
}
