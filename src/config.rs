use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// `host:port` entries; listing one twice doubles its share of keys
    pub servers: Vec<String>,
    /// Per-operation budget covering dial, write and read
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    /// Largest value a server may return for one key
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout_ms: default_timeout_ms(),
            max_idle_conns: default_max_idle_conns(),
            max_value_size: default_max_value_size(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    100
}
fn default_max_idle_conns() -> usize {
    2
}
fn default_max_value_size() -> usize {
    crate::core::protocol::DEFAULT_MAX_VALUE_SIZE
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_string())
            } else {
                ConfigError::IoError(e.to_string())
            }
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one server is required".to_string(),
            ));
        }

        for server in &self.servers {
            let valid = match server.rsplit_once(':') {
                Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
                None => false,
            };
            if !valid {
                return Err(ConfigError::ValidationError(format!(
                    "Server '{}' is not a host:port address",
                    server
                )));
            }
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
