//! Configuration management for Floodgate.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::key::DEFAULT_NAMESPACE;
use crate::ratelimit::policy::PolicyConfig;
use crate::store::{LocalStoreConfig, RedisStoreConfig};

/// Prefix for environment variable overrides, e.g. `FLOODGATE__SHARED__URL`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Limiter-wide settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Shared store connection; absent means local-only limiting
    #[serde(default)]
    pub shared: Option<SharedStoreConfig>,

    /// Per-action policy overrides, merged over the built-in table
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyConfig>,
}

/// Limiter-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace prefixed to every stored key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Local store sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long an idle local key survives past its window, in seconds
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            sweep_interval_secs: default_sweep_interval(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_idle_ttl() -> u64 {
    60
}

/// Shared store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedStoreConfig {
    /// Redis URL
    pub url: String,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_command_timeout() -> u64 {
    250
}

impl LimiterConfig {
    /// Settings for the local store.
    pub fn local_store(&self) -> LocalStoreConfig {
        LocalStoreConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            idle_ttl: Duration::from_secs(self.idle_ttl_secs),
        }
    }
}

impl SharedStoreConfig {
    /// Settings for the Redis store.
    pub fn redis_store(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            url: self.url.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
        }
    }
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration in layers: defaults, then an optional YAML file,
    /// then `FLOODGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading limiter configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the limiter misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.namespace.is_empty() {
            return Err(FloodgateError::Config("namespace must not be empty".to_string()));
        }
        if self.limiter.sweep_interval_secs == 0 {
            return Err(FloodgateError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(shared) = &self.shared {
            if shared.url.is_empty() {
                return Err(FloodgateError::Config("shared.url must not be empty".to_string()));
            }
            if shared.command_timeout_ms == 0 {
                return Err(FloodgateError::Config(
                    "shared.command_timeout_ms must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert_eq!(config.limiter.namespace, "ratelimit");
        assert_eq!(config.limiter.sweep_interval_secs, 300);
        assert!(config.shared.is_none());
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
limiter:
  namespace: market
  sweep_interval_secs: 30
shared:
  url: redis://cache:6379
  command_timeout_ms: 100
policies:
  messages:
    window_ms: 1000
    max: 3
  login:
    window_ms: 900000
    max: 5
    skip_successful: true
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.namespace, "market");
        assert_eq!(config.limiter.idle_ttl_secs, 60);

        let shared = config.shared.as_ref().unwrap();
        assert_eq!(shared.connect_timeout_ms, 2000);
        assert_eq!(
            shared.redis_store().command_timeout,
            Duration::from_millis(100)
        );

        assert_eq!(config.policies["messages"].max, 3);
        assert!(config.policies["login"].skip_successful);
    }

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config = FloodgateConfig::from_yaml("{}").unwrap();
        assert_eq!(config, FloodgateConfig::default());
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let yaml = "limiter:\n  sweep_interval_secs: 0\n";
        assert!(matches!(
            FloodgateConfig::from_yaml(yaml),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(matches!(
            FloodgateConfig::from_yaml("limiter: [not, a, map]"),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "policies:\n  typing:\n    window_ms: 500\n    max: 2\n").unwrap();

        let config = FloodgateConfig::load(Some(&path)).unwrap();
        assert_eq!(config.policies["typing"].window_ms, 500);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_local_store_settings() {
        let local = LimiterConfig::default().local_store();
        assert_eq!(local.sweep_interval, Duration::from_secs(300));
        assert_eq!(local.idle_ttl, Duration::from_secs(60));
    }
}
