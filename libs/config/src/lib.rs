//! # Delivery Configuration
//!
//! Configuration management and defaults for the reliable delivery
//! controllers, loaded from TOML with environment overrides.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use delivery_config::DeliveryConfig;
//!
//! let config = DeliveryConfig::load(None, Some("production"))?;
//! let window = config.consumer_controller.flow_control_window;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod defaults;
pub mod delivery_config;

// Re-export commonly used types
pub use delivery_config::{
    load_config, ConsumerControllerConfig, DeliveryConfig, DurableQueueConfig,
    ProducerControllerConfig, ShardingConfig, SupervisionConfig, ENV_PREFIX,
};
