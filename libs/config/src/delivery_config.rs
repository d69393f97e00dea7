//! Delivery Configuration Module
//!
//! Loads controller settings from TOML files with environment-specific
//! overrides and `RELIABLE_DELIVERY__` environment variables. Every key is
//! optional; missing keys fall back to [`crate::defaults`].

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix for environment overrides, e.g.
/// `RELIABLE_DELIVERY__CONSUMER_CONTROLLER__FLOW_CONTROL_WINDOW=100`
pub const ENV_PREFIX: &str = "RELIABLE_DELIVERY";

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    pub producer_controller: ProducerControllerConfig,
    pub consumer_controller: ConsumerControllerConfig,
    pub sharding: ShardingConfig,
    pub supervision: SupervisionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProducerControllerConfig {
    pub send_buffer_capacity: usize,
    pub chunk_large_messages_bytes: usize,
    pub resend_first_unconfirmed_idle_timeout_ms: u64,
    pub durable_queue: DurableQueueConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DurableQueueConfig {
    pub request_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub resend_first_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConsumerControllerConfig {
    pub flow_control_window: u32,
    pub resend_interval_min_ms: u64,
    pub resend_interval_max_ms: u64,
    /// Skip resend requests entirely, tolerating loss
    pub only_flow_control: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ShardingConfig {
    pub buffer_size: usize,
    pub cleanup_unused_after_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisionConfig {
    pub max_restarts: u32,
    pub restart_window_ms: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ProducerControllerConfig {
    fn default() -> Self {
        use defaults::producer_controller::*;
        Self {
            send_buffer_capacity: SEND_BUFFER_CAPACITY,
            chunk_large_messages_bytes: CHUNK_LARGE_MESSAGES_BYTES,
            resend_first_unconfirmed_idle_timeout_ms: RESEND_FIRST_UNCONFIRMED_IDLE_TIMEOUT_MS,
            durable_queue: DurableQueueConfig::default(),
        }
    }
}

impl Default for DurableQueueConfig {
    fn default() -> Self {
        use defaults::durable_queue::*;
        Self {
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            retry_attempts: RETRY_ATTEMPTS,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            max_retry_backoff_ms: MAX_RETRY_BACKOFF_MS,
            resend_first_interval_ms: RESEND_FIRST_INTERVAL_MS,
        }
    }
}

impl Default for ConsumerControllerConfig {
    fn default() -> Self {
        use defaults::consumer_controller::*;
        Self {
            flow_control_window: FLOW_CONTROL_WINDOW,
            resend_interval_min_ms: RESEND_INTERVAL_MIN_MS,
            resend_interval_max_ms: RESEND_INTERVAL_MAX_MS,
            only_flow_control: false,
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        use defaults::sharding::*;
        Self {
            buffer_size: BUFFER_SIZE,
            cleanup_unused_after_ms: CLEANUP_UNUSED_AFTER_MS,
        }
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        use defaults::supervision::*;
        Self {
            max_restarts: MAX_RESTARTS,
            restart_window_ms: RESTART_WINDOW_MS,
            min_backoff_ms: MIN_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl ProducerControllerConfig {
    pub fn resend_first_unconfirmed_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_first_unconfirmed_idle_timeout_ms)
    }
}

impl DurableQueueConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }

    pub fn resend_first_interval(&self) -> Duration {
        Duration::from_millis(self.resend_first_interval_ms)
    }
}

impl ConsumerControllerConfig {
    pub fn resend_interval_min(&self) -> Duration {
        Duration::from_millis(self.resend_interval_min_ms)
    }

    pub fn resend_interval_max(&self) -> Duration {
        Duration::from_millis(self.resend_interval_max_ms)
    }
}

impl ShardingConfig {
    pub fn cleanup_unused_after(&self) -> Duration {
        Duration::from_millis(self.cleanup_unused_after_ms)
    }
}

impl SupervisionConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl DeliveryConfig {
    /// Load configuration from files with environment overrides.
    ///
    /// Layers, later ones winning: `base_path` (or `config/delivery.toml` if
    /// present), `config/environments/<environment>.toml` next to the base
    /// file, then `RELIABLE_DELIVERY__*` environment variables.
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let default_base = PathBuf::from("config/delivery.toml");
        let base: &Path = base_path.unwrap_or(default_base.as_path());

        let mut builder = Config::builder().add_source(File::from(base).required(base_path.is_some()));

        if let Some(env) = environment {
            let env_file = base
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("environments")
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: DeliveryConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(?config, "Delivery configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document, without file or environment layering
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DeliveryConfig = toml::from_str(content).context("Failed to parse delivery configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the controllers cannot run with
    pub fn validate(&self) -> Result<()> {
        let producer = &self.producer_controller;
        if producer.send_buffer_capacity == 0 {
            bail!("producer_controller.send_buffer_capacity must be greater than 0");
        }
        if producer.durable_queue.request_timeout_ms == 0 {
            bail!("producer_controller.durable_queue.request_timeout_ms must be greater than 0");
        }
        if producer.durable_queue.retry_attempts == 0 {
            bail!("producer_controller.durable_queue.retry_attempts must be at least 1");
        }
        if producer.durable_queue.retry_backoff_ms > producer.durable_queue.max_retry_backoff_ms {
            bail!("producer_controller.durable_queue.retry_backoff_ms exceeds max_retry_backoff_ms");
        }

        let consumer = &self.consumer_controller;
        if consumer.flow_control_window == 0 {
            bail!("consumer_controller.flow_control_window must be greater than 0");
        }
        if consumer.resend_interval_min_ms == 0 {
            bail!("consumer_controller.resend_interval_min_ms must be greater than 0");
        }
        if consumer.resend_interval_min_ms > consumer.resend_interval_max_ms {
            bail!(
                "consumer_controller.resend_interval_min_ms ({}) exceeds resend_interval_max_ms ({})",
                consumer.resend_interval_min_ms,
                consumer.resend_interval_max_ms
            );
        }

        if self.sharding.buffer_size == 0 {
            bail!("sharding.buffer_size must be greater than 0");
        }
        if self.sharding.cleanup_unused_after_ms == 0 {
            bail!("sharding.cleanup_unused_after_ms must be greater than 0");
        }

        if self.supervision.min_backoff_ms > self.supervision.max_backoff_ms {
            bail!("supervision.min_backoff_ms exceeds max_backoff_ms");
        }
        Ok(())
    }
}

/// Convenience function to load configuration with defaults
pub fn load_config(environment: Option<&str>) -> Result<DeliveryConfig> {
    DeliveryConfig::load(None, environment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeliveryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.consumer_controller.flow_control_window, 50);
        assert_eq!(config.sharding.cleanup_unused_after(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = DeliveryConfig::from_toml_str(
            r#"
[consumer_controller]
flow_control_window = 8

[producer_controller.durable_queue]
retry_attempts = 3
"#,
        )
        .unwrap();

        assert_eq!(config.consumer_controller.flow_control_window, 8);
        assert_eq!(config.producer_controller.durable_queue.retry_attempts, 3);
        assert_eq!(
            config.producer_controller.durable_queue.request_timeout(),
            Duration::from_millis(defaults::durable_queue::REQUEST_TIMEOUT_MS)
        );
        assert_eq!(config.producer_controller, ProducerControllerConfig {
            durable_queue: DurableQueueConfig {
                retry_attempts: 3,
                ..DurableQueueConfig::default()
            },
            ..ProducerControllerConfig::default()
        });
    }

    #[test]
    fn test_invalid_window_rejected() {
        let err = DeliveryConfig::from_toml_str("[consumer_controller]\nflow_control_window = 0\n").unwrap_err();
        assert!(err.to_string().contains("flow_control_window"));
    }

    #[test]
    fn test_inverted_resend_interval_rejected() {
        let err = DeliveryConfig::from_toml_str(
            "[consumer_controller]\nresend_interval_min_ms = 5000\nresend_interval_max_ms = 1000\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("resend_interval_min_ms"));
    }

    #[test]
    fn test_load_base_and_environment_files() {
        let dir = tempdir().unwrap();
        let base_path = dir.path().join("delivery.toml");
        fs::write(
            &base_path,
            r#"
[producer_controller]
send_buffer_capacity = 64
chunk_large_messages_bytes = 1024

[sharding]
buffer_size = 10
"#,
        )
        .unwrap();

        fs::create_dir(dir.path().join("environments")).unwrap();
        fs::write(
            dir.path().join("environments").join("staging.toml"),
            "[sharding]\nbuffer_size = 20\n",
        )
        .unwrap();

        let config = DeliveryConfig::load(Some(&base_path), Some("staging")).unwrap();
        assert_eq!(config.producer_controller.send_buffer_capacity, 64);
        assert_eq!(config.producer_controller.chunk_large_messages_bytes, 1024);
        assert_eq!(config.sharding.buffer_size, 20);
    }

    #[test]
    fn test_environment_variable_override() {
        let dir = tempdir().unwrap();
        let base_path = dir.path().join("delivery.toml");
        fs::write(&base_path, "[supervision]\nmax_restarts = 2\n").unwrap();

        std::env::set_var("RELIABLE_DELIVERY__SUPERVISION__MAX_BACKOFF_MS", "2500");
        let config = DeliveryConfig::load(Some(&base_path), None);
        std::env::remove_var("RELIABLE_DELIVERY__SUPERVISION__MAX_BACKOFF_MS");

        let config = config.unwrap();
        assert_eq!(config.supervision.max_restarts, 2);
        assert_eq!(config.supervision.max_backoff(), Duration::from_millis(2500));
    }

    #[test]
    fn test_missing_required_file_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(DeliveryConfig::load(Some(&missing), None).is_err());
    }
}
