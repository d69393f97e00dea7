//! Protocol messages exchanged between producer controllers, consumer
//! controllers and the application actors on either end.
//!
//! ```text
//!  producer ◄── RequestNext ─── ProducerController ── SequencedMessage ──► ConsumerController ── Delivery ──► consumer
//!           ─── Msg / ask ───►                     ◄── ProducerFeedback ──                    ◄── Confirmed ──
//! ```

use crate::ack::Ack;
use crate::seq_no::{HasSeqNo, SeqNo};
use bytes::Bytes;
use delivery_actors::Recipient;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;
use uuid::Uuid;

/// One lifetime of a producer controller.
///
/// Sequence numbers restart at 1 for every incarnation, so consumers use the
/// incarnation to tell a restarted producer from a misbehaving one, and the
/// producer uses it to discard feedback addressed to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Incarnation(Uuid);

impl Incarnation {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for Incarnation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One slice of a message too large to send whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedMessage {
    pub serialized: Bytes,
    pub first_chunk: bool,
    pub last_chunk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageOrChunk<T> {
    Message(T),
    Chunk(ChunkedMessage),
}

impl<T> MessageOrChunk<T> {
    pub fn is_chunk(&self) -> bool {
        matches!(self, MessageOrChunk::Chunk(_))
    }

    /// Whether this completes a message: always for whole messages.
    pub fn completes_message(&self) -> bool {
        match self {
            MessageOrChunk::Message(_) => true,
            MessageOrChunk::Chunk(chunk) => chunk.last_chunk,
        }
    }
}

/// What travels from a producer controller to a consumer controller.
#[derive(Debug, Clone)]
pub struct SequencedMessage<T> {
    pub producer_id: String,
    pub incarnation: Incarnation,
    pub seq_nr: SeqNo,
    pub message: MessageOrChunk<T>,
    /// Start of a conversation: the consumer (re)binds to this producer
    pub first: bool,
    /// The producer wants an immediate [`ProducerFeedback::Ack`] on confirmation
    pub ack: bool,
    pub feedback_to: Recipient<ProducerFeedback>,
}

impl<T: Clone> SequencedMessage<T> {
    pub fn with_first(&self, first: bool) -> Self {
        let mut msg = self.clone();
        msg.first = first;
        msg
    }
}

impl<T> HasSeqNo for SequencedMessage<T> {
    fn seq_no(&self) -> SeqNo {
        self.seq_nr
    }
}

/// Consumer controller → producer controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerFeedback {
    /// Demand: everything up to `request_up_to_seq_nr` may be sent.
    Request {
        incarnation: Incarnation,
        confirmed_seq_nr: SeqNo,
        request_up_to_seq_nr: SeqNo,
        support_resend: bool,
        via_timeout: bool,
    },
    /// Resend everything from `from_seq_nr`, regardless of demand.
    Resend {
        incarnation: Incarnation,
        from_seq_nr: SeqNo,
    },
    /// Selective acknowledgement: confirmed up to `cumulative_ack`, nacked
    /// entries were lost on the way.
    Ack { incarnation: Incarnation, ack: Ack },
}

impl ProducerFeedback {
    pub fn incarnation(&self) -> Incarnation {
        match self {
            ProducerFeedback::Request { incarnation, .. }
            | ProducerFeedback::Resend { incarnation, .. }
            | ProducerFeedback::Ack { incarnation, .. } => *incarnation,
        }
    }
}

/// Send a message and get its sequence number back once the consumer has
/// confirmed it.
pub struct MessageWithConfirmation<T> {
    pub message: T,
    pub reply_to: oneshot::Sender<SeqNo>,
}

impl<T> MessageWithConfirmation<T> {
    pub fn new(message: T) -> (Self, oneshot::Receiver<SeqNo>) {
        let (reply_to, reply) = oneshot::channel();
        (Self { message, reply_to }, reply)
    }
}

impl<T: fmt::Debug> fmt::Debug for MessageWithConfirmation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageWithConfirmation")
            .field("message", &self.message)
            .finish()
    }
}

/// Demand signal to the producer: exactly one message may be sent through
/// `send_next_to` or `ask_next_to`.
pub struct RequestNext<T> {
    pub producer_id: String,
    pub current_seq_nr: SeqNo,
    pub confirmed_seq_nr: SeqNo,
    pub send_next_to: Recipient<T>,
    pub ask_next_to: Recipient<MessageWithConfirmation<T>>,
}

impl<T: Send + 'static> RequestNext<T> {
    pub fn send(&self, message: T) -> bool {
        self.send_next_to.tell(message)
    }

    /// Send and await confirmation through the returned receiver.
    pub fn ask(&self, message: T) -> oneshot::Receiver<SeqNo> {
        let (msg, reply) = MessageWithConfirmation::new(message);
        self.ask_next_to.tell(msg);
        reply
    }
}

impl<T> Clone for RequestNext<T> {
    fn clone(&self) -> Self {
        Self {
            producer_id: self.producer_id.clone(),
            current_seq_nr: self.current_seq_nr,
            confirmed_seq_nr: self.confirmed_seq_nr,
            send_next_to: self.send_next_to.clone(),
            ask_next_to: self.ask_next_to.clone(),
        }
    }
}

impl<T> fmt::Debug for RequestNext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestNext")
            .field("producer_id", &self.producer_id)
            .field("current_seq_nr", &self.current_seq_nr)
            .field("confirmed_seq_nr", &self.confirmed_seq_nr)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmed {
    pub seq_nr: SeqNo,
}

/// A message handed to the consumer. Nothing else is delivered until it is
/// confirmed.
pub struct Delivery<T> {
    pub message: T,
    pub confirm_to: Recipient<Confirmed>,
    pub producer_id: String,
    pub seq_nr: SeqNo,
}

impl<T> Delivery<T> {
    pub fn confirm(&self) -> bool {
        self.confirm_to.tell(Confirmed {
            seq_nr: self.seq_nr,
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for Delivery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("producer_id", &self.producer_id)
            .field("seq_nr", &self.seq_nr)
            .finish()
    }
}
