//! Reliable point-to-point delivery
//!
//! Flow-controlled, at-least-once (effectively-once for a live consumer)
//! delivery of messages between a producer and a consumer, built from two
//! actors:
//!
//! - [`ProducerController`] assigns sequence numbers, keeps unconfirmed
//!   messages for resend and optionally persists them in a
//!   [`DurableProducerQueue`] so they survive a restart
//! - [`ConsumerController`] restores order, drops duplicates, asks for
//!   missing messages and grants demand in windows
//!
//! ```text
//!  producer ◄─ RequestNext ─ ProducerController ═ SequencedMessage ═► ConsumerController ─ Delivery ─► consumer
//!                                   ▲                                          │
//!                                   └──────── Request / Resend / Ack ──────────┘
//! ```
//!
//! The sequence and buffer primitives underneath ([`SeqNo`],
//! [`AckedSendBuffer`], [`AckedReceiveBuffer`]) are plain data structures and
//! usable on their own.
//!
//! # Examples
//!
//! ```rust
//! use reliable_delivery::SeqNo;
//!
//! let last = SeqNo::MAX;
//! assert!(last.inc() > last);
//! assert!(last.inc().is_successor(last));
//! ```

pub mod ack;
pub mod acked_receive_buffer;
pub mod acked_send_buffer;
pub mod chunking;
pub mod consumer_controller;
pub mod durable;
pub mod error;
pub mod messages;
pub mod producer_controller;
pub mod seq_no;
pub mod settings;

pub use ack::Ack;
pub use acked_receive_buffer::AckedReceiveBuffer;
pub use acked_send_buffer::AckedSendBuffer;
pub use chunking::{BincodeCodec, MessageCodec};
pub use consumer_controller::{ConsumerCommand, ConsumerController, ConsumerHandoff, ProducerBinding};
pub use durable::{
    DurableProducerQueue, DurableState, InMemoryDurableQueue, JournalDurableQueue, MessageSent,
    StoreMessageSentAck, NO_QUALIFIER,
};
pub use error::{DeliveryError, DurableQueueError, Result};
pub use messages::{
    ChunkedMessage, Confirmed, Delivery, Incarnation, MessageOrChunk, MessageWithConfirmation,
    ProducerFeedback, RequestNext, SequencedMessage,
};
pub use producer_controller::{ProducerCommand, ProducerController};
pub use seq_no::{HasSeqNo, SeqNo, Sequenced};
pub use settings::{
    supervision_strategy, ConsumerControllerSettings, DurableQueueSettings, ProducerControllerSettings,
};
