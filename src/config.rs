pub mod deployment;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

pub use deployment::{DeploymentConfig, DeploymentConfigError, DeploymentValidationError};

/// Process settings: which deployment to run and how long shutdown may take.
#[derive(Debug, Clone, Deserialize)]
pub struct StewardConfig {
    #[serde(default)]
    pub deployment_path: Option<String>,
    #[serde(default = "default_shutdown_timeout")]
    #[serde(with = "duration_string")]
    pub shutdown_timeout: Duration,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            deployment_path: None,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl StewardConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("STEWARD").separator("__"))
            .build()?
            .try_deserialize()
    }
}

mod duration_string {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
