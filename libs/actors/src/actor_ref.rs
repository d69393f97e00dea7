//! Actor addressing
//!
//! [`ActorRef`] is the typed handle to a spawned actor's mailbox. [`Recipient`]
//! is a type-erased `tell` target: an adapted view of an actor ref (a message
//! adapter), or a plain channel/closure in tests. Both expose termination so
//! callers can watch the target.

use crate::error::{ActorError, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::trace;
use uuid::Uuid;

/// Unique actor identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorId {
    id: Uuid,
}

impl ActorId {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn uuid(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.id.simple())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Actor lifecycle status, observable through [`ActorRef::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorStatus {
    Starting,
    Running,
    Restarting,
    Stopped,
    Failed { reason: String },
}

impl ActorStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(self, ActorStatus::Stopped | ActorStatus::Failed { .. })
    }
}

/// What actually travels through a mailbox.
pub(crate) enum Envelope<M> {
    Message(M),
    Timer {
        key: String,
        generation: u64,
        msg: M,
    },
    Stop,
}

fn wait_terminated(
    mut status: watch::Receiver<ActorStatus>,
) -> impl Future<Output = ActorStatus> + Send + 'static {
    async move {
        let observed = status
            .wait_for(|s| s.is_terminated())
            .await
            .map(|s| s.clone());
        match observed {
            Ok(status) => status,
            // Sender gone without a terminal status: the task was aborted
            Err(_) => ActorStatus::Failed {
                reason: "actor task aborted".to_string(),
            },
        }
    }
}

/// Typed reference to a spawned actor
pub struct ActorRef<M> {
    id: ActorId,
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Envelope<M>>,
    status: watch::Receiver<ActorStatus>,
}

impl<M: Send + 'static> ActorRef<M> {
    pub(crate) fn new(
        id: ActorId,
        name: Arc<str>,
        sender: mpsc::UnboundedSender<Envelope<M>>,
        status: watch::Receiver<ActorStatus>,
    ) -> Self {
        Self {
            id,
            name,
            sender,
            status,
        }
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget send. Messages to a terminated actor are dropped.
    pub fn tell(&self, msg: M) {
        if self.sender.send(Envelope::Message(msg)).is_err() {
            trace!(actor_id = %self.id, actor = %self.name, "Dropping message to terminated actor");
        }
    }

    /// Like [`tell`](Self::tell) but reports a closed mailbox.
    pub fn try_tell(&self, msg: M) -> Result<()> {
        self.sender
            .send(Envelope::Message(msg))
            .map_err(|_| ActorError::mailbox_closed(&self.id, &self.name))
    }

    /// Ask the actor to stop after the messages already in its mailbox.
    pub fn stop(&self) {
        let _ = self.sender.send(Envelope::Stop);
    }

    pub fn status(&self) -> ActorStatus {
        self.status.borrow().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.status.borrow().is_terminated()
    }

    /// Resolves with the terminal status once the actor has stopped or failed.
    pub fn terminated(&self) -> impl Future<Output = ActorStatus> + Send + 'static {
        wait_terminated(self.status.clone())
    }

    /// Type-erased view of this actor accepting `M` directly.
    pub fn recipient(&self) -> Recipient<M> {
        self.adapt(|msg| msg)
    }

    /// Message adapter: a recipient of `N` that converts into this actor's
    /// message type on every send.
    pub fn adapt<N, F>(&self, convert: F) -> Recipient<N>
    where
        F: Fn(N) -> M + Send + Sync + 'static,
    {
        let sender = self.sender.clone();
        Recipient {
            id: self.id.clone(),
            tell: Arc::new(move |msg| sender.send(Envelope::Message(convert(msg))).is_ok()),
            status: self.status.clone(),
            _keepalive: None,
        }
    }

    pub(crate) fn send_envelope(&self, envelope: Envelope<M>) -> bool {
        self.sender.send(envelope).is_ok()
    }
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: Arc::clone(&self.name),
            sender: self.sender.clone(),
            status: self.status.clone(),
        }
    }
}

impl<M> fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl<M> PartialEq for ActorRef<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<M> Eq for ActorRef<M> {}

type TellFn<M> = dyn Fn(M) -> bool + Send + Sync;

/// Type-erased tell target.
pub struct Recipient<M> {
    id: ActorId,
    tell: Arc<TellFn<M>>,
    status: watch::Receiver<ActorStatus>,
    // Keeps the status channel open for recipients not backed by an actor
    _keepalive: Option<Arc<watch::Sender<ActorStatus>>>,
}

impl<M: Send + 'static> Recipient<M> {
    /// Recipient backed by a closure. It never reports termination.
    pub fn from_fn<F>(tell: F) -> Self
    where
        F: Fn(M) -> bool + Send + Sync + 'static,
    {
        let (status_tx, status_rx) = watch::channel(ActorStatus::Running);
        Self {
            id: ActorId::new(),
            tell: Arc::new(tell),
            status: status_rx,
            _keepalive: Some(Arc::new(status_tx)),
        }
    }

    /// Recipient forwarding into an unbounded channel.
    pub fn from_channel(sender: mpsc::UnboundedSender<M>) -> Self {
        Self::from_fn(move |msg| sender.send(msg).is_ok())
    }

    /// Id of the actor behind this recipient (a fresh id for closure recipients).
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Returns false when the target is gone.
    pub fn tell(&self, msg: M) -> bool {
        let delivered = (self.tell)(msg);
        if !delivered {
            trace!(actor_id = %self.id, "Recipient dropped message");
        }
        delivered
    }

    /// Recipient of `N` that converts and forwards to this recipient.
    pub fn contramap<N, F>(&self, convert: F) -> Recipient<N>
    where
        N: Send + 'static,
        F: Fn(N) -> M + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.tell);
        Recipient {
            id: self.id.clone(),
            tell: Arc::new(move |msg| inner(convert(msg))),
            status: self.status.clone(),
            _keepalive: self._keepalive.clone(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.status.borrow().is_terminated()
    }

    pub fn terminated(&self) -> impl Future<Output = ActorStatus> + Send + 'static {
        wait_terminated(self.status.clone())
    }
}

impl<M> Clone for Recipient<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tell: Arc::clone(&self.tell),
            status: self.status.clone(),
            _keepalive: self._keepalive.clone(),
        }
    }
}

impl<M> fmt::Debug for Recipient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient").field("id", &self.id).finish()
    }
}
