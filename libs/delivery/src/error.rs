//! Error types for reliable delivery
//!
//! Buffer overflow and protocol violations are fatal: the owning controller
//! stops and its watchers observe the failure. Durable queue failures are
//! retried with backoff and then escalated as a restart, after which the
//! controller reloads and replays from the queue.

use crate::seq_no::SeqNo;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Resend buffer capacity of {capacity} reached")]
    ResendBufferCapacityReached { capacity: usize },

    #[error("Resend unfulfillable: nacked {missing:?} no longer buffered")]
    ResendUnfulfillable { missing: Vec<SeqNo> },

    #[error("Sequence number {seq_no} must be greater than highest buffered {highest}")]
    NonMonotonicSeqNo { seq_no: SeqNo, highest: SeqNo },

    #[error("Cumulative ack {ack} exceeds highest sent {highest}")]
    AckBeyondHighestSent { ack: SeqNo, highest: SeqNo },

    #[error("Durable queue failed: {0}")]
    DurableQueue(#[from] DurableQueueError),

    #[error("Codec error: {message}")]
    Codec {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String, field: Option<String> },
}

impl DeliveryError {
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
            source: None,
        }
    }

    pub fn codec_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Codec {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    /// Fatal errors stop the controller; everything else warrants a restart
    pub fn is_fatal(&self) -> bool {
        match self {
            DeliveryError::DurableQueue(e) => !e.is_retryable(),
            _ => true,
        }
    }

    /// Error category for structured logging
    pub fn category(&self) -> &'static str {
        match self {
            DeliveryError::ResendBufferCapacityReached { .. } => "capacity",
            DeliveryError::ResendUnfulfillable { .. }
            | DeliveryError::NonMonotonicSeqNo { .. }
            | DeliveryError::AckBeyondHighestSent { .. } => "protocol",
            DeliveryError::DurableQueue(_) => "durable_queue",
            DeliveryError::Codec { .. } => "codec",
            DeliveryError::Configuration { .. } => "configuration",
        }
    }
}

/// Failures of a [`crate::DurableProducerQueue`] implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurableQueueError {
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("Write from incarnation {attempted} rejected, queue is owned by {current}")]
    StaleIncarnation { attempted: String, current: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl DurableQueueError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// A superseded incarnation will never succeed; everything else may
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DurableQueueError::StaleIncarnation { .. })
    }
}

impl From<std::io::Error> for DurableQueueError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<bincode::Error> for DurableQueueError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
