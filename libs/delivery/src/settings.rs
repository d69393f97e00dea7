//! Runtime settings derived from [`delivery_config`]

use delivery_actors::SupervisionStrategy;
use delivery_config::{
    ConsumerControllerConfig, DeliveryConfig, DurableQueueConfig, ProducerControllerConfig,
    SupervisionConfig,
};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerControllerSettings {
    pub send_buffer_capacity: usize,
    /// 0 disables chunking
    pub chunk_large_messages_bytes: usize,
    pub resend_first_unconfirmed_idle_timeout: Duration,
    pub durable_queue: DurableQueueSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableQueueSettings {
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub resend_first_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerControllerSettings {
    pub flow_control_window: u32,
    pub resend_interval_min: Duration,
    pub resend_interval_max: Duration,
    pub only_flow_control: bool,
}

impl ProducerControllerSettings {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::from(&config.producer_controller)
    }
}

impl ConsumerControllerSettings {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::from(&config.consumer_controller)
    }

    /// Half the window, and at least one message
    pub(crate) fn request_threshold(&self) -> i64 {
        (i64::from(self.flow_control_window) / 2).max(1)
    }
}

impl From<&ProducerControllerConfig> for ProducerControllerSettings {
    fn from(config: &ProducerControllerConfig) -> Self {
        Self {
            send_buffer_capacity: config.send_buffer_capacity,
            chunk_large_messages_bytes: config.chunk_large_messages_bytes,
            resend_first_unconfirmed_idle_timeout: config.resend_first_unconfirmed_idle_timeout(),
            durable_queue: DurableQueueSettings::from(&config.durable_queue),
        }
    }
}

impl From<&DurableQueueConfig> for DurableQueueSettings {
    fn from(config: &DurableQueueConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            retry_attempts: config.retry_attempts,
            retry_backoff: config.retry_backoff(),
            max_retry_backoff: config.max_retry_backoff(),
            resend_first_interval: config.resend_first_interval(),
        }
    }
}

impl From<&ConsumerControllerConfig> for ConsumerControllerSettings {
    fn from(config: &ConsumerControllerConfig) -> Self {
        Self {
            flow_control_window: config.flow_control_window,
            resend_interval_min: config.resend_interval_min(),
            resend_interval_max: config.resend_interval_max(),
            only_flow_control: config.only_flow_control,
        }
    }
}

impl Default for ProducerControllerSettings {
    fn default() -> Self {
        Self::from(&ProducerControllerConfig::default())
    }
}

impl Default for DurableQueueSettings {
    fn default() -> Self {
        Self::from(&DurableQueueConfig::default())
    }
}

impl Default for ConsumerControllerSettings {
    fn default() -> Self {
        Self::from(&ConsumerControllerConfig::default())
    }
}

pub fn supervision_strategy(config: &SupervisionConfig) -> SupervisionStrategy {
    SupervisionStrategy {
        max_restarts: config.max_restarts,
        restart_window: config.restart_window(),
        min_backoff: config.min_backoff(),
        max_backoff: config.max_backoff(),
    }
}
