//! Producer controller
//!
//! Sits between an application producer and one consumer controller. The
//! producer is only ever asked for one message at a time ([`RequestNext`]);
//! each message gets the next sequence number, is persisted when a durable
//! queue is configured, kept in the send buffer until confirmed and
//! transmitted as soon as the consumer's demand covers it.
//!
//! # State machine
//!
//! ```text
//!   WaitingForActivation ──Start+RegisterConsumer──► Idle ⇄ Active ──► stopped
//!                                                     │       │
//!                                          RequestNext▼       ▼ Msg → store → buffer → transmit
//! ```
//!
//! A restart (supervisor or process) begins a new [`Incarnation`]: sequence
//! numbers restart at 1 and unconfirmed messages from the durable queue are
//! replayed before new messages are accepted.

use crate::ack::Ack;
use crate::acked_send_buffer::AckedSendBuffer;
use crate::chunking::{split_into_chunks, MessageCodec};
use crate::durable::{now_millis, with_retry, DurableProducerQueue, DurableState, MessageSent, NO_QUALIFIER};
use crate::error::{DeliveryError, DurableQueueError, Result};
use crate::messages::{
    Incarnation, MessageOrChunk, MessageWithConfirmation, ProducerFeedback, RequestNext,
    SequencedMessage,
};
use crate::seq_no::SeqNo;
use crate::settings::ProducerControllerSettings;
use async_trait::async_trait;
use delivery_actors::{ActorBehavior, ActorContext, ActorRef, ActorSystem, Recipient, SupervisorDirective};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

const RESEND_FIRST_TIMER: &str = "resend-first";
const RESEND_FIRST_UNCONFIRMED_TIMER: &str = "resend-first-unconfirmed";

type Reply = oneshot::Sender<SeqNo>;

pub enum ProducerCommand<T> {
    Start {
        producer: Recipient<RequestNext<T>>,
    },
    RegisterConsumer {
        consumer_controller: Recipient<SequencedMessage<T>>,
    },
    Msg(T),
    MessageWithConfirmation(MessageWithConfirmation<T>),
    Feedback(ProducerFeedback),
    ResendFirst,
    ResendFirstUnconfirmed,
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

impl<T> fmt::Debug for ProducerCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerCommand::Start { .. } => write!(f, "Start"),
            ProducerCommand::RegisterConsumer { .. } => write!(f, "RegisterConsumer"),
            ProducerCommand::Msg(_) => write!(f, "Msg"),
            ProducerCommand::MessageWithConfirmation(_) => write!(f, "MessageWithConfirmation"),
            ProducerCommand::Feedback(feedback) => write!(f, "Feedback({:?})", feedback),
            ProducerCommand::ResendFirst => write!(f, "ResendFirst"),
            ProducerCommand::ResendFirstUnconfirmed => write!(f, "ResendFirstUnconfirmed"),
            ProducerCommand::StoreMessageSentCompleted { seq_nr, .. } => {
                write!(f, "StoreMessageSentCompleted({})", seq_nr)
            }
            ProducerCommand::StoreMessageConfirmedCompleted { seq_nr, .. } => {
                write!(f, "StoreMessageConfirmedCompleted({})", seq_nr)
            }
            ProducerCommand::DurableQueueFailed { error, .. } => {
                write!(f, "DurableQueueFailed({})", error)
            }
        }
    }
}

/// Adapters into this controller's mailbox
struct Endpoints<T> {
    feedback_to: Recipient<ProducerFeedback>,
    send_next_to: Recipient<T>,
    ask_next_to: Recipient<MessageWithConfirmation<T>>,
}

impl<T: Send + 'static> Endpoints<T> {
    fn new(me: &ActorRef<ProducerCommand<T>>) -> Self {
        Self {
            feedback_to: me.adapt(ProducerCommand::Feedback),
            send_next_to: me.adapt(ProducerCommand::Msg),
            ask_next_to: me.adapt(ProducerCommand::MessageWithConfirmation),
        }
    }
}

/// Per-incarnation state, replaced wholesale on restart
struct ProducerState<T> {
    incarnation: Incarnation,
    /// Next sequence number to assign
    current_seq_nr: SeqNo,
    confirmed_seq_nr: SeqNo,
    /// Demand ceiling
    requested_seq_nr: SeqNo,
    highest_transmitted: SeqNo,
    first_seq_nr: SeqNo,
    handshake_done: bool,
    support_resend: bool,
    request_next_outstanding: bool,
    send_buffer: AckedSendBuffer<SequencedMessage<T>>,
    /// Buffered, waiting for demand
    outgoing: VecDeque<SequencedMessage<T>>,
    /// Received while a store was in progress
    unsequenced: VecDeque<(T, Option<Reply>)>,
    storing: Option<Vec<SequencedMessage<T>>>,
    replies: BTreeMap<SeqNo, Reply>,
}

impl<T> ProducerState<T> {
    fn new(send_buffer_capacity: usize) -> Self {
        let first = SeqNo::new(1);
        Self {
            incarnation: Incarnation::new(),
            current_seq_nr: first,
            confirmed_seq_nr: SeqNo::ZERO,
            requested_seq_nr: first,
            highest_transmitted: SeqNo::ZERO,
            first_seq_nr: first,
            handshake_done: false,
            support_resend: true,
            request_next_outstanding: false,
            send_buffer: AckedSendBuffer::starting_after(send_buffer_capacity, SeqNo::ZERO),
            outgoing: VecDeque::new(),
            unsequenced: VecDeque::new(),
            storing: None,
            replies: BTreeMap::new(),
        }
    }
}

pub struct ProducerController<T> {
    producer_id: String,
    settings: ProducerControllerSettings,
    durable_queue: Option<Arc<dyn DurableProducerQueue<T>>>,
    codec: Option<Arc<dyn MessageCodec<T>>>,
    producer: Option<Recipient<RequestNext<T>>>,
    send_to: Option<Recipient<SequencedMessage<T>>>,
    endpoints: Option<Endpoints<T>>,
    state: ProducerState<T>,
}

impl<T: Clone + Send + 'static> ProducerController<T> {
    pub fn new(producer_id: impl Into<String>, settings: ProducerControllerSettings) -> Self {
        let state = ProducerState::new(settings.send_buffer_capacity);
        Self {
            producer_id: producer_id.into(),
            settings,
            durable_queue: None,
            codec: None,
            producer: None,
            send_to: None,
            endpoints: None,
            state,
        }
    }

    pub fn with_durable_queue(mut self, queue: Arc<dyn DurableProducerQueue<T>>) -> Self {
        self.durable_queue = Some(queue);
        self
    }

    /// Needed for chunking large messages
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec<T>>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Bind the consumer side up front instead of waiting for `RegisterConsumer`
    pub fn with_send_to(mut self, send_to: Recipient<SequencedMessage<T>>) -> Self {
        self.send_to = Some(send_to);
        self
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn spawn(self, system: &ActorSystem) -> ActorRef<ProducerCommand<T>> {
        let name = format!("producer-controller-{}", self.producer_id);
        system.spawn(name, self)
    }

    fn feedback_to(&mut self, ctx: &ActorContext<ProducerCommand<T>>) -> Recipient<ProducerFeedback> {
        self.endpoints
            .get_or_insert_with(|| Endpoints::new(ctx.self_ref()))
            .feedback_to
            .clone()
    }

    fn restore(&mut self, ctx: &ActorContext<ProducerCommand<T>>, durable: DurableState<T>) -> Result<()> {
        let feedback_to = self.feedback_to(ctx);
        let state = &mut self.state;
        state.current_seq_nr = durable.current_seq_nr;
        state.confirmed_seq_nr = durable.highest_confirmed_seq_nr;
        state.send_buffer =
            AckedSendBuffer::starting_after(self.settings.send_buffer_capacity, durable.highest_confirmed_seq_nr);

        let replayed: Vec<SequencedMessage<T>> = durable
            .unconfirmed
            .into_iter()
            .map(|sent| SequencedMessage {
                producer_id: self.producer_id.clone(),
                incarnation: state.incarnation,
                seq_nr: sent.seq_nr,
                message: sent.message,
                first: false,
                ack: sent.ack,
                feedback_to: feedback_to.clone(),
            })
            .collect();
        state.send_buffer.buffer_all(replayed.clone())?;
        state.outgoing.extend(replayed);

        state.first_seq_nr = state
            .outgoing
            .front()
            .map_or(state.current_seq_nr, |m| m.seq_nr);
        state.requested_seq_nr = state.first_seq_nr;
        state.highest_transmitted = state.first_seq_nr.dec();

        info!(
            producer_id = %self.producer_id,
            incarnation = %state.incarnation,
            replayed = state.outgoing.len(),
            current_seq_nr = %state.current_seq_nr,
            "Restored producer state from durable queue"
        );
        Ok(())
    }

    fn split(&self, message: T) -> Result<Vec<MessageOrChunk<T>>> {
        let limit = self.settings.chunk_large_messages_bytes;
        if let (Some(codec), true) = (&self.codec, limit > 0) {
            let serialized = codec.encode(&message)?;
            if serialized.len() > limit {
                let bytes = serialized.len();
                let chunks = split_into_chunks(serialized, limit);
                debug!(producer_id = %self.producer_id, bytes, chunks = chunks.len(), "Chunking large message");
                return Ok(chunks.into_iter().map(MessageOrChunk::Chunk).collect());
            }
        }
        Ok(vec![MessageOrChunk::Message(message)])
    }

    fn on_message(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>, message: T, reply: Option<Reply>) -> Result<()> {
        self.state.request_next_outstanding = false;
        if self.state.storing.is_some() {
            trace!(producer_id = %self.producer_id, "Store in progress, holding message");
            self.state.unsequenced.push_back((message, reply));
            return Ok(());
        }
        self.sequence(ctx, message, reply)
    }

    /// Assign sequence numbers, then store or buffer.
    fn sequence(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>, message: T, reply: Option<Reply>) -> Result<()> {
        let parts = self.split(message)?;
        let feedback_to = self.feedback_to(ctx);
        let count = parts.len();
        let mut batch = Vec::with_capacity(count);
        for (i, part) in parts.into_iter().enumerate() {
            let seq_nr = self.state.current_seq_nr;
            self.state.current_seq_nr = seq_nr.inc();
            batch.push(SequencedMessage {
                producer_id: self.producer_id.clone(),
                incarnation: self.state.incarnation,
                seq_nr,
                message: part,
                first: false,
                ack: reply.is_some() && i + 1 == count,
                feedback_to: feedback_to.clone(),
            });
        }

        if let (Some(reply), Some(last)) = (reply, batch.last()) {
            self.state.replies.insert(last.seq_nr, reply);
        }

        match self.durable_queue.clone() {
            Some(queue) => {
                self.store(ctx, queue, batch);
                Ok(())
            }
            None => self.accept(ctx, batch),
        }
    }

    fn store(
        &mut self,
        ctx: &mut ActorContext<ProducerCommand<T>>,
        queue: Arc<dyn DurableProducerQueue<T>>,
        batch: Vec<SequencedMessage<T>>,
    ) {
        let incarnation = self.state.incarnation;
        let settings = self.settings.durable_queue.clone();
        let timestamp_ms = now_millis();
        let sent: Vec<MessageSent<T>> = batch
            .iter()
            .map(|m| MessageSent {
                seq_nr: m.seq_nr,
                message: m.message.clone(),
                ack: m.ack,
                confirmation_qualifier: NO_QUALIFIER.to_string(),
                timestamp_ms,
            })
            .collect();
        let Some(seq_nr) = batch.last().map(|m| m.seq_nr) else {
            return;
        };
        self.state.storing = Some(batch);

        ctx.pipe_to_self(
            async move {
                for sent in sent {
                    let queue = Arc::clone(&queue);
                    with_retry(&settings, "store_message_sent", move || {
                        let queue = Arc::clone(&queue);
                        let sent = sent.clone();
                        async move { queue.store_message_sent(incarnation, sent).await }
                    })
                    .await?;
                }
                Ok::<(), DurableQueueError>(())
            },
            move |result| match result {
                Ok(()) => ProducerCommand::StoreMessageSentCompleted { incarnation, seq_nr },
                Err(error) => ProducerCommand::DurableQueueFailed { incarnation, error },
            },
        );
    }

    fn on_store_completed(
        &mut self,
        ctx: &mut ActorContext<ProducerCommand<T>>,
        incarnation: Incarnation,
        seq_nr: SeqNo,
    ) -> Result<()> {
        if incarnation != self.state.incarnation {
            debug!(producer_id = %self.producer_id, %seq_nr, "Ignoring store completion of previous incarnation");
            return Ok(());
        }
        let Some(batch) = self.state.storing.take() else {
            return Ok(());
        };
        trace!(producer_id = %self.producer_id, %seq_nr, "Message stored");
        self.accept(ctx, batch)?;

        if let Some((message, reply)) = self.state.unsequenced.pop_front() {
            self.sequence(ctx, message, reply)?;
        }
        Ok(())
    }

    fn accept(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>, batch: Vec<SequencedMessage<T>>) -> Result<()> {
        self.state.send_buffer.buffer_all(batch.clone())?;
        self.state.outgoing.extend(batch);
        self.transmit(ctx);
        self.maybe_request_next(ctx);
        Ok(())
    }

    /// Send everything the demand ceiling covers.
    fn transmit(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>) {
        let Some(send_to) = self.send_to.clone() else {
            return;
        };
        let mut transmitted = false;
        while self
            .state
            .outgoing
            .front()
            .is_some_and(|m| m.seq_nr <= self.state.requested_seq_nr)
        {
            let Some(mut msg) = self.state.outgoing.pop_front() else {
                break;
            };
            msg.first = !self.state.handshake_done && msg.seq_nr == self.state.first_seq_nr;
            trace!(producer_id = %self.producer_id, seq_nr = %msg.seq_nr, first = msg.first, "Sending message");
            self.state.highest_transmitted = msg.seq_nr;
            if msg.first {
                ctx.timers().start_single_timer(
                    RESEND_FIRST_TIMER,
                    ProducerCommand::ResendFirst,
                    self.settings.durable_queue.resend_first_interval,
                );
            }
            send_to.tell(msg);
            transmitted = true;
        }

        if transmitted && !ctx.timers().is_timer_active(RESEND_FIRST_UNCONFIRMED_TIMER) {
            self.schedule_idle_resend(ctx);
        }
    }

    fn schedule_idle_resend(&self, ctx: &mut ActorContext<ProducerCommand<T>>) {
        ctx.timers().start_single_timer(
            RESEND_FIRST_UNCONFIRMED_TIMER,
            ProducerCommand::ResendFirstUnconfirmed,
            self.settings.resend_first_unconfirmed_idle_timeout,
        );
    }

    fn maybe_request_next(&mut self, _ctx: &mut ActorContext<ProducerCommand<T>>) {
        let state = &self.state;
        let ready = !state.request_next_outstanding
            && state.storing.is_none()
            && state.unsequenced.is_empty()
            && state.outgoing.is_empty()
            && state.current_seq_nr <= state.requested_seq_nr
            // one free slot admits every chunk of the next message
            && !state.send_buffer.is_full()
            && self.send_to.is_some();
        if !ready {
            return;
        }
        let (Some(producer), Some(endpoints)) = (&self.producer, &self.endpoints) else {
            return;
        };

        trace!(
            producer_id = %self.producer_id,
            current_seq_nr = %state.current_seq_nr,
            requested_seq_nr = %state.requested_seq_nr,
            "Sending RequestNext"
        );
        producer.tell(RequestNext {
            producer_id: self.producer_id.clone(),
            current_seq_nr: state.current_seq_nr,
            confirmed_seq_nr: state.confirmed_seq_nr,
            send_next_to: endpoints.send_next_to.clone(),
            ask_next_to: endpoints.ask_next_to.clone(),
        });
        self.state.request_next_outstanding = true;
    }

    fn on_register_consumer(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>, consumer: Recipient<SequencedMessage<T>>) {
        info!(
            producer_id = %self.producer_id,
            consumer = %consumer.id(),
            rebind = self.send_to.is_some(),
            "Registered consumer controller"
        );
        self.send_to = Some(consumer);
        self.state.handshake_done = false;
        ctx.timers().cancel(RESEND_FIRST_TIMER);

        let first = self
            .state
            .send_buffer
            .first()
            .map_or(self.state.current_seq_nr, |m| m.seq_nr);
        self.state.first_seq_nr = first;
        self.state.requested_seq_nr = first.max(self.state.highest_transmitted);

        self.resend_unconfirmed(ctx);
        self.transmit(ctx);
        self.maybe_request_next(ctx);
    }

    /// Resend every transmitted, unconfirmed message, the oldest flagged `first`.
    fn resend_unconfirmed(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>) {
        let Some(send_to) = self.send_to.clone() else {
            return;
        };
        let highest = self.state.highest_transmitted;
        let unconfirmed: Vec<SequencedMessage<T>> = self
            .state
            .send_buffer
            .unacked()
            .into_iter()
            .filter(|m| m.seq_nr <= highest)
            .cloned()
            .collect();
        let Some(oldest) = unconfirmed.first().map(|m| m.seq_nr) else {
            return;
        };

        debug!(
            producer_id = %self.producer_id,
            from_seq_nr = %oldest,
            count = unconfirmed.len(),
            "Resending unconfirmed messages"
        );
        self.state.first_seq_nr = oldest;
        for (i, mut msg) in unconfirmed.into_iter().enumerate() {
            msg.first = i == 0;
            send_to.tell(msg);
        }
        if !self.state.handshake_done {
            ctx.timers().start_single_timer(
                RESEND_FIRST_TIMER,
                ProducerCommand::ResendFirst,
                self.settings.durable_queue.resend_first_interval,
            );
        }
        self.schedule_idle_resend(ctx);
    }

    fn resend_nacked(&self) {
        let Some(send_to) = &self.send_to else {
            return;
        };
        let mut count = 0;
        for msg in self.state.send_buffer.nacked() {
            let mut msg = msg.clone();
            msg.first = !self.state.handshake_done && msg.seq_nr == self.state.first_seq_nr;
            send_to.tell(msg);
            count += 1;
        }
        if count > 0 {
            debug!(producer_id = %self.producer_id, count, "Resent nacked messages");
        }
    }

    fn handshake_completed(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>) {
        if !self.state.handshake_done {
            self.state.handshake_done = true;
            ctx.timers().cancel(RESEND_FIRST_TIMER);
            debug!(producer_id = %self.producer_id, incarnation = %self.state.incarnation, "Consumer answered, handshake complete");
        }
    }

    fn on_feedback(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>, feedback: ProducerFeedback) -> Result<()> {
        if feedback.incarnation() != self.state.incarnation {
            debug!(
                producer_id = %self.producer_id,
                stale = %feedback.incarnation(),
                current = %self.state.incarnation,
                "Ignoring feedback addressed to another incarnation"
            );
            return Ok(());
        }
        self.handshake_completed(ctx);

        match feedback {
            ProducerFeedback::Request {
                confirmed_seq_nr,
                request_up_to_seq_nr,
                support_resend,
                via_timeout,
                ..
            } => {
                trace!(
                    producer_id = %self.producer_id,
                    %confirmed_seq_nr,
                    %request_up_to_seq_nr,
                    via_timeout,
                    "Received Request"
                );
                self.state.support_resend = support_resend;
                self.on_confirmed(ctx, confirmed_seq_nr)?;
                if request_up_to_seq_nr > self.state.requested_seq_nr {
                    self.state.requested_seq_nr = request_up_to_seq_nr;
                }
                if via_timeout && support_resend {
                    self.resend_unconfirmed(ctx);
                }
            }
            ProducerFeedback::Resend { from_seq_nr, .. } => {
                let highest = self.state.highest_transmitted;
                let nacks: Vec<SeqNo> = self
                    .state
                    .send_buffer
                    .unacked()
                    .into_iter()
                    .map(|m| m.seq_nr)
                    .filter(|seq_nr| *seq_nr >= from_seq_nr && *seq_nr <= highest)
                    .collect();
                debug!(producer_id = %self.producer_id, %from_seq_nr, count = nacks.len(), "Resend requested");
                self.state
                    .send_buffer
                    .acknowledge(&Ack::new(self.state.confirmed_seq_nr, nacks))?;
                self.resend_nacked();
            }
            ProducerFeedback::Ack { ack, .. } => {
                if ack.cumulative_ack < self.state.confirmed_seq_nr {
                    debug!(producer_id = %self.producer_id, %ack, confirmed_seq_nr = %self.state.confirmed_seq_nr, "Ignoring stale ack");
                    return Ok(());
                }
                trace!(producer_id = %self.producer_id, %ack, "Received Ack");
                self.state.send_buffer.acknowledge(&ack)?;
                self.advance_confirmed(ctx, ack.cumulative_ack);
                self.resend_nacked();
            }
        }

        self.transmit(ctx);
        self.maybe_request_next(ctx);
        Ok(())
    }

    fn on_confirmed(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>, confirmed: SeqNo) -> Result<()> {
        if confirmed <= self.state.confirmed_seq_nr {
            return Ok(());
        }
        if confirmed > self.state.highest_transmitted {
            warn!(
                producer_id = %self.producer_id,
                %confirmed,
                highest_transmitted = %self.state.highest_transmitted,
                "Ignoring confirmation beyond highest sent"
            );
            return Ok(());
        }
        self.state.send_buffer.acknowledge(&Ack::cumulative(confirmed))?;
        self.advance_confirmed(ctx, confirmed);
        Ok(())
    }

    /// Move the watermark: answer confirmation replies, persist, re-arm the idle timer.
    fn advance_confirmed(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>, confirmed: SeqNo) {
        if confirmed <= self.state.confirmed_seq_nr {
            return;
        }
        self.state.confirmed_seq_nr = confirmed;

        let pending = self.state.replies.split_off(&confirmed.inc());
        for (seq_nr, reply) in std::mem::replace(&mut self.state.replies, pending) {
            let _ = reply.send(seq_nr);
        }

        if let Some(queue) = self.durable_queue.clone() {
            let incarnation = self.state.incarnation;
            let settings = self.settings.durable_queue.clone();
            let timestamp_ms = now_millis();
            ctx.pipe_to_self(
                async move {
                    with_retry(&settings, "store_message_confirmed", || {
                        let queue = Arc::clone(&queue);
                        async move {
                            queue
                                .store_message_confirmed(incarnation, confirmed, NO_QUALIFIER.to_string(), timestamp_ms)
                                .await
                        }
                    })
                    .await
                },
                move |result| match result {
                    Ok(()) => ProducerCommand::StoreMessageConfirmedCompleted {
                        incarnation,
                        seq_nr: confirmed,
                    },
                    Err(error) => ProducerCommand::DurableQueueFailed { incarnation, error },
                },
            );
        }

        if self.state.highest_transmitted > confirmed {
            self.schedule_idle_resend(ctx);
        } else {
            ctx.timers().cancel(RESEND_FIRST_UNCONFIRMED_TIMER);
        }
    }

    fn on_resend_first(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>) {
        if self.state.handshake_done {
            return;
        }
        let Some(send_to) = &self.send_to else {
            return;
        };
        let Some(first) = self.state.send_buffer.first() else {
            return;
        };
        if first.seq_nr > self.state.highest_transmitted {
            return;
        }
        debug!(producer_id = %self.producer_id, seq_nr = %first.seq_nr, "Resending first message");
        self.state.first_seq_nr = first.seq_nr;
        send_to.tell(first.with_first(true));
        ctx.timers().start_single_timer(
            RESEND_FIRST_TIMER,
            ProducerCommand::ResendFirst,
            self.settings.durable_queue.resend_first_interval,
        );
    }

    fn on_resend_first_unconfirmed(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>) {
        if self.state.highest_transmitted <= self.state.confirmed_seq_nr {
            return;
        }
        if let (Some(send_to), Some(first)) = (&self.send_to, self.state.send_buffer.first()) {
            let flag_first = !self.state.handshake_done && first.seq_nr == self.state.first_seq_nr;
            debug!(
                producer_id = %self.producer_id,
                seq_nr = %first.seq_nr,
                confirmed_seq_nr = %self.state.confirmed_seq_nr,
                "No confirmation progress, resending first unconfirmed message"
            );
            send_to.tell(first.with_first(flag_first));
        }
        self.schedule_idle_resend(ctx);
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> ActorBehavior for ProducerController<T> {
    type Message = ProducerCommand<T>;
    type Error = DeliveryError;

    async fn handle(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>, msg: ProducerCommand<T>) -> Result<()> {
        match msg {
            ProducerCommand::Start { producer } => {
                if self.producer.is_some() {
                    debug!(producer_id = %self.producer_id, "Producer rebound");
                }
                self.producer = Some(producer);
                self.state.request_next_outstanding = false;
                self.maybe_request_next(ctx);
            }
            ProducerCommand::RegisterConsumer { consumer_controller } => {
                self.on_register_consumer(ctx, consumer_controller);
            }
            ProducerCommand::Msg(message) => self.on_message(ctx, message, None)?,
            ProducerCommand::MessageWithConfirmation(msg) => {
                self.on_message(ctx, msg.message, Some(msg.reply_to))?
            }
            ProducerCommand::Feedback(feedback) => self.on_feedback(ctx, feedback)?,
            ProducerCommand::ResendFirst => self.on_resend_first(ctx),
            ProducerCommand::ResendFirstUnconfirmed => self.on_resend_first_unconfirmed(ctx),
            ProducerCommand::StoreMessageSentCompleted { incarnation, seq_nr } => {
                self.on_store_completed(ctx, incarnation, seq_nr)?
            }
            ProducerCommand::StoreMessageConfirmedCompleted { seq_nr, .. } => {
                trace!(producer_id = %self.producer_id, %seq_nr, "Confirmation stored");
            }
            ProducerCommand::DurableQueueFailed { incarnation, error } => {
                if incarnation == self.state.incarnation {
                    return Err(error.into());
                }
                debug!(producer_id = %self.producer_id, %error, "Ignoring durable queue failure of previous incarnation");
            }
        }
        Ok(())
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<ProducerCommand<T>>) -> Result<()> {
        self.endpoints
            .get_or_insert_with(|| Endpoints::new(ctx.self_ref()));

        if let Some(queue) = self.durable_queue.clone() {
            let incarnation = self.state.incarnation;
            let durable = with_retry(&self.settings.durable_queue, "load_state", || {
                let queue = Arc::clone(&queue);
                async move { queue.load_state(incarnation).await }
            })
            .await?;
            self.restore(ctx, durable)?;
        }

        info!(
            producer_id = %self.producer_id,
            incarnation = %self.state.incarnation,
            durable = self.durable_queue.is_some(),
            "Producer controller started"
        );
        self.transmit(ctx);
        self.maybe_request_next(ctx);
        Ok(())
    }

    async fn pre_restart(&mut self, _ctx: &mut ActorContext<ProducerCommand<T>>) {
        let previous = self.state.incarnation;
        self.state = ProducerState::new(self.settings.send_buffer_capacity);
        warn!(
            producer_id = %self.producer_id,
            %previous,
            incarnation = %self.state.incarnation,
            "Restarting producer controller with a new incarnation"
        );
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<ProducerCommand<T>>) {
        info!(
            producer_id = %self.producer_id,
            incarnation = %self.state.incarnation,
            unconfirmed = self.state.send_buffer.len(),
            "Producer controller stopped"
        );
    }

    async fn on_error(&mut self, error: &DeliveryError) -> SupervisorDirective {
        if error.is_fatal() {
            error!(producer_id = %self.producer_id, category = error.category(), %error, "Producer controller failed");
            SupervisorDirective::Stop
        } else {
            warn!(producer_id = %self.producer_id, category = error.category(), %error, "Producer controller will restart");
            SupervisorDirective::Restart
        }
    }
}
