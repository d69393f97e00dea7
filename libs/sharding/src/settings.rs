//! Settings for the sharded controllers

use delivery_config::DeliveryConfig;
use reliable_delivery::{ConsumerControllerSettings, DurableQueueSettings, ProducerControllerSettings};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingProducerSettings {
    /// Total messages held for entities without demand
    pub buffer_size: usize,
    pub cleanup_unused_after: Duration,
    /// Settings of the per-entity producer controllers
    pub producer_controller: ProducerControllerSettings,
}

impl ShardingProducerSettings {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            buffer_size: config.sharding.buffer_size,
            cleanup_unused_after: config.sharding.cleanup_unused_after(),
            producer_controller: ProducerControllerSettings::from_config(config),
        }
    }

    pub(crate) fn durable_queue(&self) -> &DurableQueueSettings {
        &self.producer_controller.durable_queue
    }
}

impl Default for ShardingProducerSettings {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingConsumerSettings {
    pub consumer_controller: ConsumerControllerSettings,
}

impl ShardingConsumerSettings {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            consumer_controller: ConsumerControllerSettings::from_config(config),
        }
    }
}

impl Default for ShardingConsumerSettings {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = DeliveryConfig::from_toml_str(
            r#"
            [sharding]
            buffer_size = 16
            cleanup_unused_after_ms = 500

            [consumer_controller]
            flow_control_window = 8
            "#,
        )
        .unwrap();

        let producer = ShardingProducerSettings::from_config(&config);
        assert_eq!(producer.buffer_size, 16);
        assert_eq!(producer.cleanup_unused_after, Duration::from_millis(500));
        assert_eq!(producer.producer_controller.send_buffer_capacity, 1_000);

        let consumer = ShardingConsumerSettings::from_config(&config);
        assert_eq!(consumer.consumer_controller.flow_control_window, 8);
    }
}
