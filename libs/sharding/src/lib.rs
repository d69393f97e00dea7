//! Reliable delivery to sharded entities
//!
//! [`ShardingProducerController`] lets one producer address many entities by
//! id. It keeps one inner producer controller per entity and reports demand
//! for all of them in a single [`ShardingRequestNext`]. On the receiving side
//! [`ShardingConsumerController`] starts one consumer controller per entity
//! and producer, and hands deliveries to the entity's consumer.
//!
//! ```text
//!  producer ◄─ ShardingRequestNext ─ ShardingProducerController
//!                                        ├─ ProducerController(a) ─┐
//!                                        └─ ProducerController(b) ─┤ ShardingEnvelope<SequencedMessage>
//!                                                                  ▼
//!                                    region ─► ShardingConsumerController
//!                                                 ├─ ConsumerController(a) ─► entity a
//!                                                 └─ ConsumerController(b) ─► entity b
//! ```

pub mod consumer;
pub mod envelope;
pub mod error;
pub mod producer;
pub mod settings;

pub use consumer::{ShardingConsumerCommand, ShardingConsumerController};
pub use envelope::{EntityId, ShardingEnvelope};
pub use error::{Result, ShardingError};
pub use producer::{ShardingProducerCommand, ShardingProducerController, ShardingRequestNext};
pub use settings::{ShardingConsumerSettings, ShardingProducerSettings};
