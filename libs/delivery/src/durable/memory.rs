use super::{DurableProducerQueue, DurableState, MessageSent, QueueContents, StoreMessageSentAck};
use crate::error::DurableQueueError;
use crate::messages::Incarnation;
use crate::seq_no::SeqNo;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// Process-local durable queue.
///
/// Survives restarts of the controllers sharing it, not of the process.
/// Failures can be injected with [`fail_next_requests`](Self::fail_next_requests).
pub struct InMemoryDurableQueue<T> {
    contents: Mutex<QueueContents<T>>,
    failures: AtomicU32,
}

impl<T: Clone + Send + 'static> InMemoryDurableQueue<T> {
    pub fn new() -> Self {
        Self {
            contents: Mutex::new(QueueContents::new()),
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` requests fail with a storage error.
    pub fn fail_next_requests(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn unconfirmed(&self) -> Vec<MessageSent<T>> {
        self.contents.lock().unconfirmed().to_vec()
    }

    pub fn state(&self) -> DurableState<T> {
        self.contents.lock().state()
    }

    fn injected_failure(&self, operation: &str) -> Result<(), DurableQueueError> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => {
                debug!(operation, "Injected durable queue failure");
                Err(DurableQueueError::storage(format!("injected failure in {}", operation)))
            }
            Err(_) => Ok(()),
        }
    }
}

impl<T: Clone + Send + 'static> Default for InMemoryDurableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> DurableProducerQueue<T> for InMemoryDurableQueue<T> {
    async fn load_state(&self, incarnation: Incarnation) -> Result<DurableState<T>, DurableQueueError> {
        self.injected_failure("load_state")?;
        let state = self.contents.lock().claim(incarnation);
        debug!(
            %incarnation,
            unconfirmed = state.unconfirmed.len(),
            current_seq_nr = %state.current_seq_nr,
            "Durable queue claimed"
        );
        Ok(state)
    }

    async fn store_message_sent(
        &self,
        incarnation: Incarnation,
        sent: MessageSent<T>,
    ) -> Result<StoreMessageSentAck, DurableQueueError> {
        self.injected_failure("store_message_sent")?;
        let mut contents = self.contents.lock();
        contents.check_owner(incarnation)?;
        let stored_seq_nr = sent.seq_nr;
        contents.apply_sent(sent);
        trace!(%incarnation, seq_nr = %stored_seq_nr, "Stored message sent");
        Ok(StoreMessageSentAck { stored_seq_nr })
    }

    async fn store_message_confirmed(
        &self,
        incarnation: Incarnation,
        seq_nr: SeqNo,
        confirmation_qualifier: String,
        timestamp_ms: u64,
    ) -> Result<(), DurableQueueError> {
        self.injected_failure("store_message_confirmed")?;
        let mut contents = self.contents.lock();
        contents.check_owner(incarnation)?;
        contents.apply_confirmed(seq_nr, &confirmation_qualifier, timestamp_ms);
        trace!(%incarnation, %seq_nr, qualifier = %confirmation_qualifier, "Stored confirmation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::NO_QUALIFIER;
    use crate::messages::MessageOrChunk;

    fn sent(seq: i64) -> MessageSent<u32> {
        MessageSent {
            seq_nr: SeqNo::new(seq),
            message: MessageOrChunk::Message(seq as u32 * 100),
            ack: false,
            confirmation_qualifier: NO_QUALIFIER.to_string(),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_store_and_reload() {
        let queue = InMemoryDurableQueue::new();
        let first = Incarnation::new();
        assert_eq!(queue.load_state(first).await.unwrap(), DurableState::empty());

        for seq in 1..=3 {
            queue.store_message_sent(first, sent(seq)).await.unwrap();
        }
        queue
            .store_message_confirmed(first, SeqNo::new(1), NO_QUALIFIER.to_string(), 5)
            .await
            .unwrap();
        assert_eq!(queue.unconfirmed().len(), 2);

        let second = Incarnation::new();
        let state = queue.load_state(second).await.unwrap();
        assert_eq!(state.current_seq_nr, SeqNo::new(3));
        assert_eq!(state.unconfirmed[0].message, MessageOrChunk::Message(200));
        assert_eq!(state.unconfirmed[0].seq_nr, SeqNo::new(1));
    }

    #[tokio::test]
    async fn test_stale_incarnation_rejected() {
        let queue = InMemoryDurableQueue::new();
        let old = Incarnation::new();
        queue.load_state(old).await.unwrap();
        queue.load_state(Incarnation::new()).await.unwrap();

        let err = queue.store_message_sent(old, sent(1)).await.unwrap_err();
        assert!(matches!(err, DurableQueueError::StaleIncarnation { .. }));
        assert!(queue.unconfirmed().is_empty());
    }

    #[test]
    fn test_injected_failures() {
        let queue = InMemoryDurableQueue::new();
        let incarnation = Incarnation::new();
        queue.fail_next_requests(2);
        assert!(tokio_test::block_on(queue.load_state(incarnation)).is_err());
        assert!(tokio_test::block_on(queue.store_message_sent(incarnation, sent(1))).is_err());
        assert!(tokio_test::block_on(queue.store_message_sent(incarnation, sent(1))).is_ok());
    }
}
