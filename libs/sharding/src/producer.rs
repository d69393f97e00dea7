//! Sharding producer controller
//!
//! One actor fronting a producer that sends to many entities. Each entity
//! gets its own inner [`ProducerController`] (created on first use, producer
//! id `<producer_id>-<entity_id>`) whose transmissions are wrapped in a
//! [`ShardingEnvelope`] and handed to the region. The producer sees a single
//! demand signal, [`ShardingRequestNext`], listing which entities can take a
//! message right away; messages for the others are buffered per entity.
//!
//! With a durable queue every message is stored under the outer sequence
//! number with the entity id as confirmation qualifier, so a restarted
//! controller routes the unconfirmed ones to their entities again.

use crate::envelope::{EntityId, ShardingEnvelope};
use crate::error::{Result, ShardingError};
use crate::settings::ShardingProducerSettings;
use async_trait::async_trait;
use delivery_actors::{ActorBehavior, ActorContext, ActorRef, ActorSystem, Recipient, SupervisorDirective};
use reliable_delivery::durable::{now_millis, with_retry};
use reliable_delivery::{
    DeliveryError, DurableProducerQueue, DurableQueueError, Incarnation, MessageOrChunk, MessageSent,
    MessageWithConfirmation, ProducerCommand, ProducerController, ProducerControllerSettings, RequestNext,
    SeqNo, SequencedMessage,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const CLEANUP_TIMER: &str = "cleanup-unused";

type Reply = oneshot::Sender<SeqNo>;

/// Demand signal to the producer: one message, to any entity, may be sent.
pub struct ShardingRequestNext<T> {
    pub send_next_to: Recipient<ShardingEnvelope<T>>,
    pub ask_next_to: Recipient<MessageWithConfirmation<ShardingEnvelope<T>>>,
    /// Entities that will transmit the next message immediately
    pub entities_with_demand: BTreeSet<EntityId>,
    /// Messages already waiting, per entity without demand
    pub buffered_for_entities_without_demand: BTreeMap<EntityId, usize>,
}

impl<T: Send + 'static> ShardingRequestNext<T> {
    pub fn send(&self, entity_id: impl Into<EntityId>, message: T) -> bool {
        self.send_next_to.tell(ShardingEnvelope::new(entity_id, message))
    }

    /// Send and get the outer sequence number back once the entity confirmed it.
    pub fn ask(&self, entity_id: impl Into<EntityId>, message: T) -> oneshot::Receiver<SeqNo> {
        let (msg, reply) = MessageWithConfirmation::new(ShardingEnvelope::new(entity_id, message));
        self.ask_next_to.tell(msg);
        reply
    }
}

impl<T> Clone for ShardingRequestNext<T> {
    fn clone(&self) -> Self {
        Self {
            send_next_to: self.send_next_to.clone(),
            ask_next_to: self.ask_next_to.clone(),
            entities_with_demand: self.entities_with_demand.clone(),
            buffered_for_entities_without_demand: self.buffered_for_entities_without_demand.clone(),
        }
    }
}

impl<T> fmt::Debug for ShardingRequestNext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardingRequestNext")
            .field("entities_with_demand", &self.entities_with_demand)
            .field("buffered_for_entities_without_demand", &self.buffered_for_entities_without_demand)
            .finish()
    }
}

pub enum ShardingProducerCommand<T> {
    Start {
        producer: Recipient<ShardingRequestNext<T>>,
    },
    Msg(ShardingEnvelope<T>),
    MessageWithConfirmation(MessageWithConfirmation<ShardingEnvelope<T>>),
    /// Demand from an entity's producer controller
    WrappedRequestNext {
        entity_id: EntityId,
        generation: u64,
        next: RequestNext<T>,
    },
    /// An entity confirmed (or, with `confirmed == false`, lost) a message
    EntityReply {
        entity_id: EntityId,
        generation: u64,
        seq_nr: SeqNo,
        confirmed: bool,
    },
    EntityTerminated {
        entity_id: EntityId,
        generation: u64,
    },
    CleanupUnused,
    StoreMessageSentCompleted {
        incarnation: Incarnation,
        seq_nr: SeqNo,
    },
    StoreMessageConfirmedCompleted {
        incarnation: Incarnation,
        seq_nr: SeqNo,
    },
    DurableQueueFailed {
        incarnation: Incarnation,
        error: DurableQueueError,
    },
}

impl<T> fmt::Debug for ShardingProducerCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingProducerCommand::Start { .. } => write!(f, "Start"),
            ShardingProducerCommand::Msg(env) => write!(f, "Msg({})", env.entity_id),
            ShardingProducerCommand::MessageWithConfirmation(msg) => {
                write!(f, "MessageWithConfirmation({})", msg.message.entity_id)
            }
            ShardingProducerCommand::WrappedRequestNext { entity_id, next, .. } => {
                write!(f, "WrappedRequestNext({}, {})", entity_id, next.current_seq_nr)
            }
            ShardingProducerCommand::EntityReply {
                entity_id,
                seq_nr,
                confirmed,
                ..
            } => write!(f, "EntityReply({}, {}, {})", entity_id, seq_nr, confirmed),
            ShardingProducerCommand::EntityTerminated { entity_id, .. } => {
                write!(f, "EntityTerminated({})", entity_id)
            }
            ShardingProducerCommand::CleanupUnused => write!(f, "CleanupUnused"),
            ShardingProducerCommand::StoreMessageSentCompleted { seq_nr, .. } => {
                write!(f, "StoreMessageSentCompleted({})", seq_nr)
            }
            ShardingProducerCommand::StoreMessageConfirmedCompleted { seq_nr, .. } => {
                write!(f, "StoreMessageConfirmedCompleted({})", seq_nr)
            }
            ShardingProducerCommand::DurableQueueFailed { error, .. } => {
                write!(f, "DurableQueueFailed({})", error)
            }
        }
    }
}

/// A message with its outer sequence number
struct Pending<T> {
    seq_nr: SeqNo,
    message: T,
    reply_to: Option<Reply>,
}

/// Routing state of one entity
struct OutState<T> {
    generation: u64,
    producer_controller: ActorRef<ProducerCommand<T>>,
    next: Option<RequestNext<T>>,
    buffered: VecDeque<Pending<T>>,
    /// Handed to the entity's producer controller, keyed by outer sequence number
    unconfirmed: BTreeMap<SeqNo, Pending<T>>,
    last_used: Instant,
}

impl<T> OutState<T> {
    fn is_idle(&self) -> bool {
        self.buffered.is_empty() && self.unconfirmed.is_empty()
    }
}

type Endpoints<T> = (
    Recipient<ShardingEnvelope<T>>,
    Recipient<MessageWithConfirmation<ShardingEnvelope<T>>>,
);

pub struct ShardingProducerController<T> {
    producer_id: String,
    settings: ShardingProducerSettings,
    region: Recipient<ShardingEnvelope<SequencedMessage<T>>>,
    durable_queue: Option<Arc<dyn DurableProducerQueue<T>>>,
    incarnation: Incarnation,
    producer: Option<Recipient<ShardingRequestNext<T>>>,
    endpoints: Option<Endpoints<T>>,
    out: HashMap<EntityId, OutState<T>>,
    current_seq_nr: SeqNo,
    next_generation: u64,
    request_outstanding: bool,
    storing: Option<(EntityId, Pending<T>)>,
    unstored: VecDeque<(ShardingEnvelope<T>, Option<Reply>)>,
}

impl<T: Clone + Send + 'static> ShardingProducerController<T> {
    pub fn new(
        producer_id: impl Into<String>,
        region: Recipient<ShardingEnvelope<SequencedMessage<T>>>,
        settings: ShardingProducerSettings,
    ) -> Self {
        Self {
            producer_id: producer_id.into(),
            settings,
            region,
            durable_queue: None,
            incarnation: Incarnation::new(),
            producer: None,
            endpoints: None,
            out: HashMap::new(),
            current_seq_nr: SeqNo::new(1),
            next_generation: 0,
            request_outstanding: false,
            storing: None,
            unstored: VecDeque::new(),
        }
    }

    pub fn with_durable_queue(mut self, queue: Arc<dyn DurableProducerQueue<T>>) -> Self {
        self.durable_queue = Some(queue);
        self
    }

    pub fn spawn(self, system: &ActorSystem) -> ActorRef<ShardingProducerCommand<T>> {
        let name = format!("sharding-producer-controller-{}", self.producer_id);
        system.spawn(name, self)
    }

    fn total_buffered(&self) -> usize {
        self.out.values().map(|o| o.buffered.len()).sum()
    }

    fn on_message(
        &mut self,
        ctx: &mut ActorContext<ShardingProducerCommand<T>>,
        envelope: ShardingEnvelope<T>,
        reply: Option<Reply>,
    ) -> Result<()> {
        self.request_outstanding = false;
        if self.storing.is_some() {
            trace!(producer_id = %self.producer_id, entity_id = %envelope.entity_id, "Store in progress, holding message");
            self.unstored.push_back((envelope, reply));
            return Ok(());
        }
        self.sequence(ctx, envelope, reply)
    }

    fn sequence(
        &mut self,
        ctx: &mut ActorContext<ShardingProducerCommand<T>>,
        envelope: ShardingEnvelope<T>,
        reply: Option<Reply>,
    ) -> Result<()> {
        let buffered = self.total_buffered();
        if buffered >= self.settings.buffer_size {
            return Err(ShardingError::BufferFull {
                entity_id: envelope.entity_id,
                buffered,
                buffer_size: self.settings.buffer_size,
            });
        }

        let seq_nr = self.current_seq_nr;
        self.current_seq_nr = seq_nr.inc();
        let pending = Pending {
            seq_nr,
            message: envelope.message,
            reply_to: reply,
        };

        match self.durable_queue.clone() {
            Some(queue) => self.store(ctx, queue, envelope.entity_id, pending),
            None => {
                self.route(ctx, envelope.entity_id, pending);
                self.maybe_request_next();
            }
        }
        Ok(())
    }

    fn store(
        &mut self,
        ctx: &mut ActorContext<ShardingProducerCommand<T>>,
        queue: Arc<dyn DurableProducerQueue<T>>,
        entity_id: EntityId,
        pending: Pending<T>,
    ) {
        let incarnation = self.incarnation;
        let seq_nr = pending.seq_nr;
        let settings = self.settings.durable_queue().clone();
        let sent = MessageSent {
            seq_nr,
            message: MessageOrChunk::Message(pending.message.clone()),
            ack: pending.reply_to.is_some(),
            confirmation_qualifier: entity_id.clone(),
            timestamp_ms: now_millis(),
        };
        self.storing = Some((entity_id, pending));

        ctx.pipe_to_self(
            async move {
                with_retry(&settings, "store_message_sent", move || {
                    let queue = Arc::clone(&queue);
                    let sent = sent.clone();
                    async move { queue.store_message_sent(incarnation, sent).await }
                })
                .await
            },
            move |result| match result {
                Ok(_) => ShardingProducerCommand::StoreMessageSentCompleted { incarnation, seq_nr },
                Err(error) => ShardingProducerCommand::DurableQueueFailed { incarnation, error },
            },
        );
    }

    fn on_store_completed(
        &mut self,
        ctx: &mut ActorContext<ShardingProducerCommand<T>>,
        incarnation: Incarnation,
        seq_nr: SeqNo,
    ) -> Result<()> {
        if incarnation != self.incarnation {
            debug!(producer_id = %self.producer_id, %seq_nr, "Ignoring store completion of previous incarnation");
            return Ok(());
        }
        let Some((entity_id, pending)) = self.storing.take() else {
            return Ok(());
        };
        trace!(producer_id = %self.producer_id, %entity_id, %seq_nr, "Message stored");
        self.route(ctx, entity_id, pending);

        if let Some((envelope, reply)) = self.unstored.pop_front() {
            self.sequence(ctx, envelope, reply)?;
        }
        self.maybe_request_next();
        Ok(())
    }

    fn store_confirmed(&self, ctx: &ActorContext<ShardingProducerCommand<T>>, entity_id: &EntityId, seq_nr: SeqNo) {
        let Some(queue) = self.durable_queue.clone() else {
            return;
        };
        let incarnation = self.incarnation;
        let settings = self.settings.durable_queue().clone();
        let qualifier = entity_id.clone();
        let timestamp_ms = now_millis();
        ctx.pipe_to_self(
            async move {
                with_retry(&settings, "store_message_confirmed", move || {
                    let queue = Arc::clone(&queue);
                    let qualifier = qualifier.clone();
                    async move {
                        queue
                            .store_message_confirmed(incarnation, seq_nr, qualifier, timestamp_ms)
                            .await
                    }
                })
                .await
            },
            move |result| match result {
                Ok(()) => ShardingProducerCommand::StoreMessageConfirmedCompleted { incarnation, seq_nr },
                Err(error) => ShardingProducerCommand::DurableQueueFailed { incarnation, error },
            },
        );
    }

    /// Queue `pending` for its entity, creating the entity's controller if needed.
    fn route(&mut self, ctx: &mut ActorContext<ShardingProducerCommand<T>>, entity_id: EntityId, pending: Pending<T>) {
        let out = self.out_for(ctx, &entity_id);
        out.last_used = Instant::now();
        out.buffered.push_back(pending);
        self.flush(ctx, &entity_id);
    }

    fn out_for(&mut self, ctx: &mut ActorContext<ShardingProducerCommand<T>>, entity_id: &EntityId) -> &mut OutState<T> {
        match self.out.entry(entity_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let generation = self.next_generation;
                self.next_generation += 1;
                let out = spawn_entity(
                    ctx,
                    &self.producer_id,
                    &self.settings.producer_controller,
                    &self.region,
                    entity_id,
                    generation,
                );
                entry.insert(out)
            }
        }
    }

    /// Hand the oldest buffered message to the entity if it has demand.
    fn flush(&mut self, ctx: &mut ActorContext<ShardingProducerCommand<T>>, entity_id: &EntityId) {
        let Some(out) = self.out.get_mut(entity_id) else {
            return;
        };
        if out.buffered.is_empty() {
            return;
        }
        let Some(next) = out.next.take() else {
            return;
        };
        let Some(pending) = out.buffered.pop_front() else {
            return;
        };

        let seq_nr = pending.seq_nr;
        trace!(
            producer_id = %self.producer_id,
            %entity_id,
            %seq_nr,
            entity_seq_nr = %next.current_seq_nr,
            "Sending message to entity"
        );
        let confirmation = next.ask(pending.message.clone());
        let entity = entity_id.clone();
        let generation = out.generation;
        ctx.pipe_to_self(confirmation, move |result| ShardingProducerCommand::EntityReply {
            entity_id: entity,
            generation,
            seq_nr,
            confirmed: result.is_ok(),
        });
        out.unconfirmed.insert(seq_nr, pending);
    }

    fn on_request_next(
        &mut self,
        ctx: &mut ActorContext<ShardingProducerCommand<T>>,
        entity_id: EntityId,
        generation: u64,
        next: RequestNext<T>,
    ) {
        match self.out.get_mut(&entity_id) {
            Some(out) if out.generation == generation => out.next = Some(next),
            _ => {
                debug!(producer_id = %self.producer_id, %entity_id, "Ignoring demand from a retired entity controller");
                return;
            }
        }
        self.flush(ctx, &entity_id);
        self.maybe_request_next();
    }

    fn on_entity_reply(
        &mut self,
        ctx: &mut ActorContext<ShardingProducerCommand<T>>,
        entity_id: EntityId,
        generation: u64,
        seq_nr: SeqNo,
        confirmed: bool,
    ) {
        let Some(out) = self.out.get_mut(&entity_id).filter(|o| o.generation == generation) else {
            trace!(producer_id = %self.producer_id, %entity_id, %seq_nr, "Ignoring reply from a retired entity controller");
            return;
        };
        if !confirmed {
            debug!(producer_id = %self.producer_id, %entity_id, %seq_nr, "Entity controller stopped before confirming");
            return;
        }
        let Some(pending) = out.unconfirmed.remove(&seq_nr) else {
            return;
        };
        out.last_used = Instant::now();
        trace!(producer_id = %self.producer_id, %entity_id, %seq_nr, "Entity confirmed message");
        if let Some(reply) = pending.reply_to {
            let _ = reply.send(seq_nr);
        }
        self.store_confirmed(ctx, &entity_id, seq_nr);
    }

    /// Restart a failed entity controller with everything it had not confirmed.
    fn on_entity_terminated(
        &mut self,
        ctx: &mut ActorContext<ShardingProducerCommand<T>>,
        entity_id: EntityId,
        generation: u64,
    ) {
        if !self.out.get(&entity_id).is_some_and(|o| o.generation == generation) {
            trace!(producer_id = %self.producer_id, %entity_id, generation, "Retired entity controller terminated");
            return;
        }
        let Some(out) = self.out.remove(&entity_id) else {
            return;
        };
        let mut requeue: VecDeque<Pending<T>> = out.unconfirmed.into_values().collect();
        requeue.extend(out.buffered);
        if requeue.is_empty() {
            debug!(producer_id = %self.producer_id, %entity_id, "Entity producer controller stopped");
            return;
        }

        warn!(
            producer_id = %self.producer_id,
            %entity_id,
            requeued = requeue.len(),
            "Entity producer controller terminated with unconfirmed messages, starting a new one"
        );
        let out = self.out_for(ctx, &entity_id);
        out.buffered = requeue;
    }

    /// Retire entities idle for `cleanup_unused_after` with nothing outstanding.
    fn cleanup_unused(&mut self) {
        let now = Instant::now();
        let idle_after = self.settings.cleanup_unused_after;
        let idle: Vec<EntityId> = self
            .out
            .iter()
            .filter(|(_, o)| o.is_idle() && now.duration_since(o.last_used) >= idle_after)
            .map(|(entity_id, _)| entity_id.clone())
            .collect();

        for entity_id in idle {
            if let Some(out) = self.out.remove(&entity_id) {
                debug!(producer_id = %self.producer_id, %entity_id, "Evicting unused entity");
                out.producer_controller.stop();
            }
        }
    }

    fn maybe_request_next(&mut self) {
        if self.request_outstanding || self.storing.is_some() || !self.unstored.is_empty() {
            return;
        }
        let buffered = self.total_buffered();
        if buffered >= self.settings.buffer_size {
            debug!(producer_id = %self.producer_id, buffered, "Buffer full, holding back demand");
            return;
        }
        let (Some(producer), Some((send_next_to, ask_next_to))) = (&self.producer, &self.endpoints) else {
            return;
        };

        let entities_with_demand: BTreeSet<EntityId> = self
            .out
            .iter()
            .filter(|(_, o)| o.next.is_some())
            .map(|(entity_id, _)| entity_id.clone())
            .collect();
        let buffered_for_entities_without_demand: BTreeMap<EntityId, usize> = self
            .out
            .iter()
            .filter(|(_, o)| o.next.is_none() && !o.buffered.is_empty())
            .map(|(entity_id, o)| (entity_id.clone(), o.buffered.len()))
            .collect();

        trace!(
            producer_id = %self.producer_id,
            with_demand = entities_with_demand.len(),
            buffered,
            "Sending RequestNext"
        );
        producer.tell(ShardingRequestNext {
            send_next_to: send_next_to.clone(),
            ask_next_to: ask_next_to.clone(),
            entities_with_demand,
            buffered_for_entities_without_demand,
        });
        self.request_outstanding = true;
    }

    fn stop_entities(&mut self) {
        for (_, out) in self.out.drain() {
            out.producer_controller.stop();
        }
    }
}

fn spawn_entity<T: Clone + Send + 'static>(
    ctx: &mut ActorContext<ShardingProducerCommand<T>>,
    producer_id: &str,
    settings: &ProducerControllerSettings,
    region: &Recipient<ShardingEnvelope<SequencedMessage<T>>>,
    entity_id: &EntityId,
    generation: u64,
) -> OutState<T> {
    let target = entity_id.clone();
    let send_to = region.contramap(move |msg: SequencedMessage<T>| ShardingEnvelope::new(target.clone(), msg));
    let producer_controller = ProducerController::new(format!("{}-{}", producer_id, entity_id), settings.clone())
        .with_send_to(send_to)
        .spawn(ctx.system());

    let entity = entity_id.clone();
    producer_controller.tell(ProducerCommand::Start {
        producer: ctx
            .self_ref()
            .adapt(move |next| ShardingProducerCommand::WrappedRequestNext {
                entity_id: entity.clone(),
                generation,
                next,
            }),
    });
    ctx.watch_with(
        producer_controller.terminated(),
        ShardingProducerCommand::EntityTerminated {
            entity_id: entity_id.clone(),
            generation,
        },
    );
    debug!(%producer_id, %entity_id, generation, "Started entity producer controller");

    OutState {
        generation,
        producer_controller,
        next: None,
        buffered: VecDeque::new(),
        unconfirmed: BTreeMap::new(),
        last_used: Instant::now(),
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> ActorBehavior for ShardingProducerController<T> {
    type Message = ShardingProducerCommand<T>;
    type Error = ShardingError;

    async fn handle(
        &mut self,
        ctx: &mut ActorContext<ShardingProducerCommand<T>>,
        msg: ShardingProducerCommand<T>,
    ) -> Result<()> {
        match msg {
            ShardingProducerCommand::Start { producer } => {
                if self.producer.is_some() {
                    debug!(producer_id = %self.producer_id, "Producer rebound");
                }
                self.producer = Some(producer);
                self.request_outstanding = false;
                self.maybe_request_next();
            }
            ShardingProducerCommand::Msg(envelope) => self.on_message(ctx, envelope, None)?,
            ShardingProducerCommand::MessageWithConfirmation(msg) => {
                self.on_message(ctx, msg.message, Some(msg.reply_to))?
            }
            ShardingProducerCommand::WrappedRequestNext {
                entity_id,
                generation,
                next,
            } => self.on_request_next(ctx, entity_id, generation, next),
            ShardingProducerCommand::EntityReply {
                entity_id,
                generation,
                seq_nr,
                confirmed,
            } => self.on_entity_reply(ctx, entity_id, generation, seq_nr, confirmed),
            ShardingProducerCommand::EntityTerminated { entity_id, generation } => {
                self.on_entity_terminated(ctx, entity_id, generation);
            }
            ShardingProducerCommand::CleanupUnused => self.cleanup_unused(),
            ShardingProducerCommand::StoreMessageSentCompleted { incarnation, seq_nr } => {
                self.on_store_completed(ctx, incarnation, seq_nr)?
            }
            ShardingProducerCommand::StoreMessageConfirmedCompleted { seq_nr, .. } => {
                trace!(producer_id = %self.producer_id, %seq_nr, "Confirmation stored");
            }
            ShardingProducerCommand::DurableQueueFailed { incarnation, error } => {
                if incarnation == self.incarnation {
                    return Err(DeliveryError::from(error).into());
                }
                debug!(producer_id = %self.producer_id, %error, "Ignoring durable queue failure of previous incarnation");
            }
        }
        Ok(())
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<ShardingProducerCommand<T>>) -> Result<()> {
        let me = ctx.self_ref().clone();
        self.endpoints = Some((
            me.adapt(ShardingProducerCommand::Msg),
            me.adapt(ShardingProducerCommand::MessageWithConfirmation),
        ));
        let interval = (self.settings.cleanup_unused_after / 2).max(Duration::from_millis(1));
        ctx.timers()
            .start_periodic_timer(CLEANUP_TIMER, interval, || ShardingProducerCommand::CleanupUnused);

        if let Some(queue) = self.durable_queue.clone() {
            let incarnation = self.incarnation;
            let state = with_retry(self.settings.durable_queue(), "load_state", || {
                let queue = Arc::clone(&queue);
                async move { queue.load_state(incarnation).await }
            })
            .await
            .map_err(DeliveryError::from)?;

            self.current_seq_nr = state.current_seq_nr;
            let replayed = state.unconfirmed.len();
            for sent in state.unconfirmed {
                match sent.message {
                    MessageOrChunk::Message(message) => {
                        let pending = Pending {
                            seq_nr: sent.seq_nr,
                            message,
                            reply_to: None,
                        };
                        self.route(ctx, sent.confirmation_qualifier, pending);
                    }
                    MessageOrChunk::Chunk(_) => {
                        warn!(producer_id = %self.producer_id, seq_nr = %sent.seq_nr, "Skipping chunked message in durable queue");
                    }
                }
            }
            info!(
                producer_id = %self.producer_id,
                replayed,
                current_seq_nr = %self.current_seq_nr,
                "Restored sharding producer state from durable queue"
            );
        }

        info!(
            producer_id = %self.producer_id,
            incarnation = %self.incarnation,
            durable = self.durable_queue.is_some(),
            "Sharding producer controller started"
        );
        self.maybe_request_next();
        Ok(())
    }

    async fn pre_restart(&mut self, _ctx: &mut ActorContext<ShardingProducerCommand<T>>) {
        let previous = self.incarnation;
        self.stop_entities();
        self.incarnation = Incarnation::new();
        self.current_seq_nr = SeqNo::new(1);
        self.request_outstanding = false;
        self.storing = None;
        self.unstored.clear();
        warn!(
            producer_id = %self.producer_id,
            %previous,
            incarnation = %self.incarnation,
            "Restarting sharding producer controller"
        );
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<ShardingProducerCommand<T>>) {
        let entities = self.out.len();
        self.stop_entities();
        info!(producer_id = %self.producer_id, entities, "Sharding producer controller stopped");
    }

    async fn on_error(&mut self, error: &ShardingError) -> SupervisorDirective {
        error!(producer_id = %self.producer_id, category = error.category(), %error, "Sharding producer controller failed");
        if error.is_fatal() {
            SupervisorDirective::Stop
        } else {
            SupervisorDirective::Restart
        }
    }
}
