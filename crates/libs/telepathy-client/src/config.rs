use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Client-side tuning shared by the proxies built from one entry point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Capacity of each channel's membership-event queue.
    pub group_queue_capacity: usize,
    /// Account features the account manager prepares on every account.
    pub account_features: Vec<String>,
    /// Bind stateful proxies to the unique name of their service.
    pub track_name_owner: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            group_queue_capacity: 256,
            account_features: vec!["core".to_owned()],
            track_name_owner: true,
        }
    }
}

impl ClientConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "group_queue_capacity must be greater than zero".to_owned(),
            ));
        }
        for name in &self.account_features {
            if crate::account::Account::feature_by_name(name).is_none() {
                return Err(ConfigError::Invalid(format!("unknown account feature '{name}'")));
            }
        }
        Ok(())
    }
}
