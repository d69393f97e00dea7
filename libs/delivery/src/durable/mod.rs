//! Durable producer queue
//!
//! Producer-side delivery state that survives crashes. A producer controller
//! stores every message before transmitting it and records confirmations as
//! they arrive; on start it loads what is still unconfirmed and replays it
//! before accepting new messages.
//!
//! `load_state` claims the queue for the loading incarnation. The remaining
//! unconfirmed messages are renumbered from 1 in their original order, and
//! writes tagged with an older incarnation are rejected from then on.

mod journal;
mod memory;

pub use journal::JournalDurableQueue;
pub use memory::InMemoryDurableQueue;

use crate::error::DurableQueueError;
use crate::messages::{Incarnation, MessageOrChunk};
use crate::seq_no::SeqNo;
use crate::settings::DurableQueueSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

/// Confirmation qualifier of producers that confirm cumulatively
pub const NO_QUALIFIER: &str = "";

/// A stored, not yet confirmed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSent<T> {
    pub seq_nr: SeqNo,
    pub message: MessageOrChunk<T>,
    pub ack: bool,
    /// Confirmations are cumulative per qualifier, e.g. per destination entity
    pub confirmation_qualifier: String,
    pub timestamp_ms: u64,
}

/// What a producer controller starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableState<T> {
    /// Next sequence number to assign
    pub current_seq_nr: SeqNo,
    pub highest_confirmed_seq_nr: SeqNo,
    /// Highest confirmed sequence number and its timestamp per qualifier
    pub confirmed_seq_nr: HashMap<String, (SeqNo, u64)>,
    /// Oldest first
    pub unconfirmed: Vec<MessageSent<T>>,
}

impl<T> DurableState<T> {
    pub fn empty() -> Self {
        Self {
            current_seq_nr: SeqNo::new(1),
            highest_confirmed_seq_nr: SeqNo::ZERO,
            confirmed_seq_nr: HashMap::new(),
            unconfirmed: Vec::new(),
        }
    }
}

/// Acknowledges a completed `store_message_sent`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMessageSentAck {
    pub stored_seq_nr: SeqNo,
}

#[async_trait]
pub trait DurableProducerQueue<T: Send + 'static>: Send + Sync + 'static {
    /// Claim the queue for `incarnation` and return the state to resume from.
    async fn load_state(&self, incarnation: Incarnation) -> Result<DurableState<T>, DurableQueueError>;

    async fn store_message_sent(
        &self,
        incarnation: Incarnation,
        sent: MessageSent<T>,
    ) -> Result<StoreMessageSentAck, DurableQueueError>;

    /// Everything with `confirmation_qualifier` up to `seq_nr` is confirmed.
    async fn store_message_confirmed(
        &self,
        incarnation: Incarnation,
        seq_nr: SeqNo,
        confirmation_qualifier: String,
        timestamp_ms: u64,
    ) -> Result<(), DurableQueueError>;
}

/// Wall-clock milliseconds for confirmation timestamps
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Run one durable queue request with a per-attempt timeout, retrying
/// retryable failures with exponential backoff.
pub async fn with_retry<R, F, Fut>(
    settings: &DurableQueueSettings,
    operation: &'static str,
    mut request: F,
) -> Result<R, DurableQueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, DurableQueueError>>,
{
    let max_attempts = settings.retry_attempts.max(1);
    let mut backoff = settings.retry_backoff;
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(settings.request_timeout, request()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DurableQueueError::Timeout {
                operation,
                timeout_ms: settings.request_timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Durable queue request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(settings.max_retry_backoff);
                attempt += 1;
            }
            Err(e) => {
                error!(operation, attempt, error = %e, "Durable queue request failed");
                return Err(e);
            }
        }
    }
}

/// Queue contents shared by the bundled stores: an in-memory projection of
/// the sent/confirmed event stream.
#[derive(Debug, Clone)]
pub(crate) struct QueueContents<T> {
    owner: Option<Incarnation>,
    current_seq_nr: SeqNo,
    highest_confirmed_seq_nr: SeqNo,
    confirmed: HashMap<String, (SeqNo, u64)>,
    sent: Vec<MessageSent<T>>,
}

impl<T: Clone> QueueContents<T> {
    pub(crate) fn new() -> Self {
        Self {
            owner: None,
            current_seq_nr: SeqNo::new(1),
            highest_confirmed_seq_nr: SeqNo::ZERO,
            confirmed: HashMap::new(),
            sent: Vec::new(),
        }
    }

    pub(crate) fn check_owner(&self, incarnation: Incarnation) -> Result<(), DurableQueueError> {
        match self.owner {
            Some(owner) if owner != incarnation => Err(DurableQueueError::StaleIncarnation {
                attempted: incarnation.to_string(),
                current: owner.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn apply_sent(&mut self, sent: MessageSent<T>) {
        self.current_seq_nr = self.current_seq_nr.max(sent.seq_nr.inc());
        self.sent.push(sent);
    }

    pub(crate) fn apply_confirmed(&mut self, seq_nr: SeqNo, qualifier: &str, timestamp_ms: u64) {
        let entry = self
            .confirmed
            .entry(qualifier.to_string())
            .or_insert((seq_nr, timestamp_ms));
        if seq_nr >= entry.0 {
            *entry = (seq_nr, timestamp_ms);
        }
        self.highest_confirmed_seq_nr = self.highest_confirmed_seq_nr.max(seq_nr);
        self.sent
            .retain(|m| m.confirmation_qualifier != qualifier || m.seq_nr > seq_nr);
    }

    /// Hand the queue to `incarnation`: drop a trailing incomplete chunk
    /// group, renumber what is left from 1 and forget confirmed history.
    pub(crate) fn claim(&mut self, incarnation: Incarnation) -> DurableState<T> {
        let complete = self
            .sent
            .iter()
            .rposition(|m| m.message.completes_message())
            .map_or(0, |i| i + 1);
        self.sent.truncate(complete);

        let mut seq_nr = SeqNo::new(1);
        for sent in &mut self.sent {
            sent.seq_nr = seq_nr;
            seq_nr = seq_nr.inc();
        }

        self.owner = Some(incarnation);
        self.current_seq_nr = seq_nr;
        self.highest_confirmed_seq_nr = SeqNo::ZERO;
        self.confirmed.clear();

        self.state()
    }

    pub(crate) fn state(&self) -> DurableState<T> {
        DurableState {
            current_seq_nr: self.current_seq_nr,
            highest_confirmed_seq_nr: self.highest_confirmed_seq_nr,
            confirmed_seq_nr: self.confirmed.clone(),
            unconfirmed: self.sent.clone(),
        }
    }

    pub(crate) fn unconfirmed(&self) -> &[MessageSent<T>] {
        &self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ChunkedMessage;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    pub(crate) fn sent(seq: i64, text: &str, qualifier: &str) -> MessageSent<String> {
        MessageSent {
            seq_nr: SeqNo::new(seq),
            message: MessageOrChunk::Message(text.to_string()),
            ack: false,
            confirmation_qualifier: qualifier.to_string(),
            timestamp_ms: 0,
        }
    }

    fn chunk(seq: i64, first_chunk: bool, last_chunk: bool) -> MessageSent<String> {
        MessageSent {
            seq_nr: SeqNo::new(seq),
            message: MessageOrChunk::Chunk(ChunkedMessage {
                serialized: Bytes::from_static(b"xx"),
                first_chunk,
                last_chunk,
            }),
            ack: false,
            confirmation_qualifier: NO_QUALIFIER.to_string(),
            timestamp_ms: 0,
        }
    }

    fn fast_retry(attempts: u32) -> DurableQueueSettings {
        DurableQueueSettings {
            request_timeout: Duration::from_millis(50),
            retry_attempts: attempts,
            retry_backoff: Duration::from_millis(1),
            max_retry_backoff: Duration::from_millis(4),
            ..DurableQueueSettings::default()
        }
    }

    #[test]
    fn test_confirmations_are_per_qualifier() {
        let mut contents = QueueContents::new();
        contents.apply_sent(sent(1, "a1", "a"));
        contents.apply_sent(sent(2, "b1", "b"));
        contents.apply_sent(sent(3, "a2", "a"));

        contents.apply_confirmed(SeqNo::new(3), "a", 10);
        let state = contents.state();
        assert_eq!(state.current_seq_nr, SeqNo::new(4));
        assert_eq!(state.highest_confirmed_seq_nr, SeqNo::new(3));
        assert_eq!(state.unconfirmed, vec![sent(2, "b1", "b")]);
        assert_eq!(state.confirmed_seq_nr.get("a"), Some(&(SeqNo::new(3), 10)));

        // late, lower confirmation does not regress
        contents.apply_confirmed(SeqNo::new(1), "a", 11);
        assert_eq!(contents.state().confirmed_seq_nr.get("a"), Some(&(SeqNo::new(3), 10)));
    }

    #[test]
    fn test_claim_renumbers_and_fences() {
        let mut contents = QueueContents::new();
        for seq in 1..=5 {
            contents.apply_sent(sent(seq, &format!("m{}", seq), NO_QUALIFIER));
        }
        contents.apply_confirmed(SeqNo::new(2), NO_QUALIFIER, 0);

        let old = Incarnation::new();
        contents.claim(old);
        let new = Incarnation::new();
        let state = contents.claim(new);

        assert_eq!(state.current_seq_nr, SeqNo::new(4));
        assert_eq!(state.highest_confirmed_seq_nr, SeqNo::ZERO);
        let seqs: Vec<i64> = state.unconfirmed.iter().map(|m| m.seq_nr.value()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(state.unconfirmed[0].message, MessageOrChunk::Message("m3".to_string()));

        assert!(contents.check_owner(new).is_ok());
        assert!(matches!(
            contents.check_owner(old),
            Err(DurableQueueError::StaleIncarnation { .. })
        ));
    }

    #[test]
    fn test_claim_drops_trailing_partial_chunks() {
        let mut contents = QueueContents::new();
        contents.apply_sent(chunk(1, true, false));
        contents.apply_sent(chunk(2, false, true));
        contents.apply_sent(chunk(3, true, false));
        contents.apply_sent(chunk(4, false, false));

        let state = contents.claim(Incarnation::new());
        assert_eq!(state.unconfirmed.len(), 2);
        assert_eq!(state.current_seq_nr, SeqNo::new(3));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_retry(5), "store", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DurableQueueError::storage("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_retry(3), "store", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DurableQueueError::storage("down")) }
        })
        .await;
        assert_eq!(result, Err(DurableQueueError::storage("down")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_times_out_and_skips_stale_incarnation() {
        let result: Result<(), _> = with_retry(&fast_retry(1), "load", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DurableQueueError::Timeout { operation: "load", .. })));

        let calls = AtomicU32::new(0);
        let stale: Result<(), _> = with_retry(&fast_retry(5), "store", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(DurableQueueError::StaleIncarnation {
                    attempted: "a".into(),
                    current: "b".into(),
                })
            }
        })
        .await;
        assert!(stale.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
