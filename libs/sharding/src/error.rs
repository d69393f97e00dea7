//! Sharding error types

use reliable_delivery::DeliveryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardingError {
    #[error("Buffer full: {buffered} messages waiting for demand (limit {buffer_size}), dropping message for entity {entity_id}")]
    BufferFull {
        entity_id: String,
        buffered: usize,
        buffer_size: usize,
    },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl ShardingError {
    /// Everything but a retryable durable queue failure stops the controller
    pub fn is_fatal(&self) -> bool {
        match self {
            ShardingError::BufferFull { .. } => true,
            ShardingError::Delivery(e) => e.is_fatal(),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ShardingError::BufferFull { .. } => "buffer",
            ShardingError::Delivery(e) => e.category(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShardingError>;
