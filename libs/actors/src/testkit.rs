//! Test utilities for actor-based components
//!
//! [`TestProbe`] stands in for a collaborator actor: hand out its
//! [`Recipient`] and assert on what arrives.

use crate::actor_ref::Recipient;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TestProbe<M> {
    sender: mpsc::UnboundedSender<M>,
    receiver: mpsc::UnboundedReceiver<M>,
    timeout: Duration,
}

impl<M: Send + 'static> TestProbe<M> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn recipient(&self) -> Recipient<M> {
        Recipient::from_channel(self.sender.clone())
    }

    /// Next message, panicking after the probe's timeout.
    pub async fn expect_message(&mut self) -> M {
        let timeout = self.timeout;
        self.expect_message_within(timeout).await
    }

    pub async fn expect_message_within(&mut self, timeout: Duration) -> M {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => panic!("probe channel closed"),
            Err(_) => panic!("timeout ({:?}) while waiting for message", timeout),
        }
    }

    /// Skip messages until one matches `predicate`.
    pub async fn fish_for_message<F>(&mut self, mut predicate: F) -> M
    where
        F: FnMut(&M) -> bool,
    {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(msg)) if predicate(&msg) => return msg,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("probe channel closed"),
                Err(_) => panic!("timeout ({:?}) while fishing for message", self.timeout),
            }
        }
    }

    pub fn try_receive(&mut self) -> Option<M> {
        self.receiver.try_recv().ok()
    }
}

impl<M: Send + Debug + 'static> TestProbe<M> {
    pub async fn expect_no_message(&mut self, within: Duration) {
        if let Ok(Some(msg)) = tokio::time::timeout(within, self.receiver.recv()).await {
            panic!("unexpected message {:?}", msg);
        }
    }
}

impl<M: Send + 'static> Default for TestProbe<M> {
    fn default() -> Self {
        Self::new()
    }
}
