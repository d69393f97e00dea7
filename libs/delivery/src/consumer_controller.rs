//! Consumer controller
//!
//! Receives [`SequencedMessage`]s from one producer controller at a time,
//! restores their order, drops duplicates, reassembles chunks and hands them
//! to the consumer one [`Delivery`] at a time. Demand is granted in windows:
//! once half of the requested window is confirmed, the next window is
//! requested.
//!
//! Lost messages are recovered two ways: gaps in the received sequence are
//! nacked right away with a selective ack, and a silent producer is asked to
//! resend through a re-request with `via_timeout` set, backing off from
//! `resend_interval_min` to `resend_interval_max`.

use crate::ack::Ack;
use crate::acked_receive_buffer::AckedReceiveBuffer;
use crate::chunking::{ChunkAssembler, MessageCodec};
use crate::error::{DeliveryError, Result};
use crate::messages::{
    Confirmed, Delivery, Incarnation, MessageOrChunk, ProducerFeedback, SequencedMessage,
};
use crate::producer_controller::ProducerCommand;
use crate::seq_no::SeqNo;
use crate::settings::ConsumerControllerSettings;
use async_trait::async_trait;
use delivery_actors::{
    ActorBehavior, ActorContext, ActorId, ActorRef, ActorSystem, Recipient, SupervisorDirective,
};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

const RETRY_TIMER: &str = "retry";

pub enum ConsumerCommand<T> {
    Start {
        delivery_to: Recipient<Delivery<T>>,
    },
    RegisterToProducerController {
        producer_controller: Recipient<ProducerCommand<T>>,
    },
    Sequenced(SequencedMessage<T>),
    Confirmed {
        seq_nr: SeqNo,
    },
    Retry,
    /// Stop once everything received has been delivered and confirmed
    DeliverThenStop,
    /// Stop and hand the unconfirmed state to a replacement
    Handoff {
        reply_to: oneshot::Sender<ConsumerHandoff<T>>,
    },
}

impl<T> fmt::Debug for ConsumerCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerCommand::Start { .. } => write!(f, "Start"),
            ConsumerCommand::RegisterToProducerController { .. } => {
                write!(f, "RegisterToProducerController")
            }
            ConsumerCommand::Sequenced(msg) => write!(f, "Sequenced({}, {})", msg.producer_id, msg.seq_nr),
            ConsumerCommand::Confirmed { seq_nr } => write!(f, "Confirmed({})", seq_nr),
            ConsumerCommand::Retry => write!(f, "Retry"),
            ConsumerCommand::DeliverThenStop => write!(f, "DeliverThenStop"),
            ConsumerCommand::Handoff { .. } => write!(f, "Handoff"),
        }
    }
}

/// The producer incarnation a consumer controller is currently serving
#[derive(Debug, Clone)]
pub struct ProducerBinding {
    pub producer_id: String,
    pub incarnation: Incarnation,
    pub feedback_to: Recipient<ProducerFeedback>,
}

/// Unconfirmed state passed from a stopping consumer controller to its
/// replacement ([`ConsumerController::with_handoff`]).
pub struct ConsumerHandoff<T> {
    pub binding: Option<ProducerBinding>,
    pub confirmed_seq_nr: SeqNo,
    pub requested_seq_nr: SeqNo,
    /// Everything received after `confirmed_seq_nr`
    pub buffer: AckedReceiveBuffer<SequencedMessage<T>>,
}

impl<T> fmt::Debug for ConsumerHandoff<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandoff")
            .field("binding", &self.binding)
            .field("confirmed_seq_nr", &self.confirmed_seq_nr)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

struct InFlight<T> {
    seq_nr: SeqNo,
    message: T,
    ack: bool,
    /// What was received for it: one message or all of its chunks
    sources: Vec<SequencedMessage<T>>,
}

pub struct ConsumerController<T> {
    settings: ConsumerControllerSettings,
    codec: Option<Arc<dyn MessageCodec<T>>>,
    delivery_to: Option<Recipient<Delivery<T>>>,
    confirm_to: Option<Recipient<Confirmed>>,
    registered_to: Option<ActorId>,
    /// Held until started, or until the current producer's messages are done
    stash: VecDeque<SequencedMessage<T>>,
    binding: Option<ProducerBinding>,
    receive_buffer: AckedReceiveBuffer<SequencedMessage<T>>,
    pending: VecDeque<SequencedMessage<T>>,
    assembler: ChunkAssembler,
    chunk_sources: Vec<SequencedMessage<T>>,
    in_flight: Option<InFlight<T>>,
    confirmed_seq_nr: SeqNo,
    /// Confirmed messages plus chunks already handed to the assembler
    flow_seq_nr: SeqNo,
    requested_seq_nr: SeqNo,
    last_nacks: BTreeSet<SeqNo>,
    retry_interval: Duration,
    received_since_retry: bool,
    stopping: bool,
}

impl<T: Clone + Send + 'static> ConsumerController<T> {
    pub fn new(settings: ConsumerControllerSettings) -> Self {
        let retry_interval = settings.resend_interval_min;
        Self {
            settings,
            codec: None,
            delivery_to: None,
            confirm_to: None,
            registered_to: None,
            stash: VecDeque::new(),
            binding: None,
            receive_buffer: AckedReceiveBuffer::new(),
            pending: VecDeque::new(),
            assembler: ChunkAssembler::new(),
            chunk_sources: Vec::new(),
            in_flight: None,
            confirmed_seq_nr: SeqNo::ZERO,
            flow_seq_nr: SeqNo::ZERO,
            requested_seq_nr: SeqNo::ZERO,
            last_nacks: BTreeSet::new(),
            retry_interval,
            received_since_retry: false,
            stopping: false,
        }
    }

    /// Needed to reassemble chunked messages
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec<T>>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Continue where a handed-off consumer controller stopped.
    pub fn with_handoff(mut self, handoff: ConsumerHandoff<T>) -> Self {
        let mut buffer = AckedReceiveBuffer::starting_after(handoff.confirmed_seq_nr)
            .with_max_nacks(self.settings.flow_control_window as usize);
        buffer.merge_from(handoff.buffer);
        self.receive_buffer = buffer;
        self.binding = handoff.binding;
        self.confirmed_seq_nr = handoff.confirmed_seq_nr;
        self.flow_seq_nr = handoff.confirmed_seq_nr;
        self.requested_seq_nr = handoff.requested_seq_nr;
        self
    }

    pub fn spawn(self, system: &ActorSystem, name: impl Into<String>) -> ActorRef<ConsumerCommand<T>> {
        system.spawn(name, self)
    }

    fn window(&self) -> i64 {
        i64::from(self.settings.flow_control_window)
    }

    fn is_new_binding(&self, msg: &SequencedMessage<T>) -> bool {
        self.binding
            .as_ref()
            .map_or(true, |b| b.incarnation != msg.incarnation || b.producer_id != msg.producer_id)
    }

    /// Work left for the current binding
    fn is_busy(&self) -> bool {
        self.in_flight.is_some() || !self.pending.is_empty() || !self.chunk_sources.is_empty()
    }

    fn on_sequenced(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>, msg: SequencedMessage<T>) -> Result<()> {
        let new_binding = self.is_new_binding(&msg);
        if self.delivery_to.is_none() || (new_binding && self.is_busy()) {
            self.stash_message(msg);
            return Ok(());
        }
        self.received_since_retry = true;

        if new_binding {
            if msg.first || self.settings.only_flow_control {
                self.bind(&msg);
            } else {
                debug!(
                    producer_id = %msg.producer_id,
                    incarnation = %msg.incarnation,
                    seq_nr = %msg.seq_nr,
                    "Message from unknown producer is not first, requesting resend"
                );
                msg.feedback_to.tell(ProducerFeedback::Request {
                    incarnation: msg.incarnation,
                    confirmed_seq_nr: SeqNo::ZERO,
                    request_up_to_seq_nr: SeqNo::new(self.window()),
                    support_resend: true,
                    via_timeout: true,
                });
                return Ok(());
            }
        }

        self.ingest(ctx, msg)
    }

    fn stash_message(&mut self, msg: SequencedMessage<T>) {
        if self.stash.len() >= self.settings.flow_control_window as usize {
            warn!(
                producer_id = %msg.producer_id,
                seq_nr = %msg.seq_nr,
                stashed = self.stash.len(),
                "Stash full, dropping message"
            );
            return;
        }
        trace!(producer_id = %msg.producer_id, seq_nr = %msg.seq_nr, "Stashing message");
        self.stash.push_back(msg);
    }

    fn unstash(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>) -> Result<()> {
        while self.delivery_to.is_some() {
            let blocked = match self.stash.front() {
                Some(msg) => self.is_new_binding(msg) && self.is_busy(),
                None => break,
            };
            if blocked {
                break;
            }
            if let Some(msg) = self.stash.pop_front() {
                self.on_sequenced(ctx, msg)?;
            }
        }
        Ok(())
    }

    fn bind(&mut self, msg: &SequencedMessage<T>) {
        let previous = self.binding.replace(ProducerBinding {
            producer_id: msg.producer_id.clone(),
            incarnation: msg.incarnation,
            feedback_to: msg.feedback_to.clone(),
        });
        info!(
            producer_id = %msg.producer_id,
            incarnation = %msg.incarnation,
            seq_nr = %msg.seq_nr,
            previous = ?previous.map(|b| b.incarnation.to_string()),
            "Consumer controller bound to producer"
        );

        let start = msg.seq_nr.dec();
        self.receive_buffer =
            AckedReceiveBuffer::starting_after(start).with_max_nacks(self.settings.flow_control_window as usize);
        self.pending.clear();
        self.assembler.clear();
        self.chunk_sources.clear();
        self.last_nacks.clear();
        self.confirmed_seq_nr = start;
        self.flow_seq_nr = start;
        self.requested_seq_nr = start.wrapping_add(self.window());
        self.retry_interval = self.settings.resend_interval_min;
        self.send_request(false);
    }

    fn ingest(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>, msg: SequencedMessage<T>) -> Result<()> {
        let seq_nr = msg.seq_nr;
        if self.receive_buffer.has_seen(seq_nr) {
            debug!(producer_id = %msg.producer_id, %seq_nr, first = msg.first, "Dropping duplicate message");
            self.send_request(false);
            return Ok(());
        }

        if seq_nr > self.requested_seq_nr {
            debug!(
                producer_id = %msg.producer_id,
                %seq_nr,
                requested_seq_nr = %self.requested_seq_nr,
                "Dropping message beyond the requested window"
            );
            return Ok(());
        }

        if self.settings.only_flow_control && !seq_nr.is_successor(self.receive_buffer.last_delivered()) {
            debug!(
                producer_id = %msg.producer_id,
                expected = %self.receive_buffer.last_delivered().inc(),
                %seq_nr,
                "Skipping missing messages"
            );
            self.receive_buffer = AckedReceiveBuffer::starting_after(seq_nr.dec());
        }

        trace!(producer_id = %msg.producer_id, %seq_nr, "Received message");
        self.receive_buffer.receive(msg);
        let (deliverable, ack) = self.receive_buffer.extract_deliverable();
        self.pending.extend(deliverable);

        if !self.settings.only_flow_control && ack.nacks != self.last_nacks {
            if !ack.nacks.is_empty() {
                debug!(nacks = ?ack.nacks, "Requesting resend of missing messages");
                self.send_ack(ack.nacks.clone());
            }
            self.last_nacks = ack.nacks;
        }

        self.deliver_next(ctx)
    }

    fn drain_buffer(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>) -> Result<()> {
        let (deliverable, ack) = self.receive_buffer.extract_deliverable();
        self.pending.extend(deliverable);
        self.last_nacks = ack.nacks;
        self.deliver_next(ctx)
    }

    fn deliver_next(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>) -> Result<()> {
        while self.in_flight.is_none() {
            let Some(msg) = self.pending.pop_front() else {
                break;
            };
            let seq_nr = msg.seq_nr;
            let ack = msg.ack;
            let assembled = match &msg.message {
                MessageOrChunk::Message(message) => {
                    let message = message.clone();
                    self.dispatch(ctx, InFlight {
                        seq_nr,
                        message,
                        ack,
                        sources: vec![msg],
                    });
                    continue;
                }
                MessageOrChunk::Chunk(chunk) => self.assembler.push(chunk),
            };
            self.chunk_sources.push(msg);

            match assembled {
                Some(bytes) => {
                    let codec = self
                        .codec
                        .as_ref()
                        .ok_or_else(|| DeliveryError::codec("received a chunked message but no codec is configured"))?;
                    let message = codec.decode(&bytes)?;
                    let sources = std::mem::take(&mut self.chunk_sources);
                    trace!(%seq_nr, chunks = sources.len(), "Reassembled chunked message");
                    self.dispatch(ctx, InFlight {
                        seq_nr,
                        message,
                        ack,
                        sources,
                    });
                }
                None => {
                    self.flow_seq_nr = seq_nr;
                    self.maybe_request_more();
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>, in_flight: InFlight<T>) {
        let confirm_to = self
            .confirm_to
            .get_or_insert_with(|| ctx.self_ref().adapt(|c: Confirmed| ConsumerCommand::Confirmed { seq_nr: c.seq_nr }))
            .clone();
        let producer_id = in_flight
            .sources
            .first()
            .map(|m| m.producer_id.clone())
            .unwrap_or_default();

        if let Some(delivery_to) = &self.delivery_to {
            trace!(%producer_id, seq_nr = %in_flight.seq_nr, "Delivering message");
            let delivered = delivery_to.tell(Delivery {
                message: in_flight.message.clone(),
                confirm_to,
                producer_id,
                seq_nr: in_flight.seq_nr,
            });
            if !delivered {
                warn!(seq_nr = %in_flight.seq_nr, "Consumer is gone, stopping consumer controller");
                ctx.stop();
            }
        }
        self.in_flight = Some(in_flight);
    }

    fn on_confirmed(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>, seq_nr: SeqNo) -> Result<()> {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) if in_flight.seq_nr == seq_nr => in_flight,
            other => {
                self.in_flight = other;
                debug!(%seq_nr, "Ignoring confirmation of a message not in flight");
                return Ok(());
            }
        };

        trace!(%seq_nr, "Message confirmed");
        self.confirmed_seq_nr = seq_nr;
        self.flow_seq_nr = seq_nr;
        if in_flight.ack {
            let delivered = self.receive_buffer.last_delivered();
            let nacks = self.last_nacks.iter().copied().filter(|n| *n > delivered).collect();
            self.send_ack(nacks);
        }
        self.maybe_request_more();

        self.deliver_next(ctx)?;
        self.unstash(ctx)?;
        self.check_stop(ctx);
        Ok(())
    }

    /// Request the next window once half of the current one is used up.
    fn maybe_request_more(&mut self) {
        let remaining = self.flow_seq_nr.distance_to(self.requested_seq_nr);
        if remaining <= self.settings.request_threshold() {
            self.requested_seq_nr = self.flow_seq_nr.wrapping_add(self.window());
            self.send_request(false);
        }
    }

    fn send_request(&self, via_timeout: bool) {
        let Some(binding) = &self.binding else {
            return;
        };
        trace!(
            producer_id = %binding.producer_id,
            confirmed_seq_nr = %self.confirmed_seq_nr,
            request_up_to_seq_nr = %self.requested_seq_nr,
            via_timeout,
            "Sending Request"
        );
        binding.feedback_to.tell(ProducerFeedback::Request {
            incarnation: binding.incarnation,
            confirmed_seq_nr: self.confirmed_seq_nr,
            request_up_to_seq_nr: self.requested_seq_nr,
            support_resend: !self.settings.only_flow_control,
            via_timeout,
        });
    }

    fn send_ack(&self, nacks: BTreeSet<SeqNo>) {
        if let Some(binding) = &self.binding {
            binding.feedback_to.tell(ProducerFeedback::Ack {
                incarnation: binding.incarnation,
                ack: Ack {
                    cumulative_ack: self.confirmed_seq_nr,
                    nacks,
                },
            });
        }
    }

    fn on_retry(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>) {
        if self.binding.is_some() {
            if self.received_since_retry {
                self.received_since_retry = false;
                self.retry_interval = self.settings.resend_interval_min;
            } else if self.in_flight.is_none() && self.pending.is_empty() {
                debug!(
                    confirmed_seq_nr = %self.confirmed_seq_nr,
                    interval_ms = self.retry_interval.as_millis() as u64,
                    "Nothing received, re-requesting from producer"
                );
                self.send_request(true);
                self.retry_interval = self
                    .retry_interval
                    .saturating_mul(2)
                    .min(self.settings.resend_interval_max);
            }
        }
        let interval = self.retry_interval;
        ctx.timers().start_single_timer(RETRY_TIMER, ConsumerCommand::Retry, interval);
    }

    fn check_stop(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>) {
        if self.stopping && !self.is_busy() && self.receive_buffer.is_empty() {
            info!(confirmed_seq_nr = %self.confirmed_seq_nr, "All messages delivered, stopping consumer controller");
            ctx.stop();
        }
    }

    fn take_handoff(&mut self) -> ConsumerHandoff<T> {
        let mut buffer = AckedReceiveBuffer::starting_after(self.confirmed_seq_nr);
        let in_flight = self.in_flight.take().map(|f| f.sources).unwrap_or_default();
        let received = std::mem::take(&mut self.receive_buffer);
        for msg in in_flight
            .into_iter()
            .chain(self.chunk_sources.drain(..))
            .chain(self.pending.drain(..))
            .chain(received.into_buffered())
        {
            buffer.receive(msg);
        }
        ConsumerHandoff {
            binding: self.binding.clone(),
            confirmed_seq_nr: self.confirmed_seq_nr,
            requested_seq_nr: self.requested_seq_nr,
            buffer,
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> ActorBehavior for ConsumerController<T> {
    type Message = ConsumerCommand<T>;
    type Error = DeliveryError;

    async fn handle(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>, msg: ConsumerCommand<T>) -> Result<()> {
        match msg {
            ConsumerCommand::Start { delivery_to } => {
                info!(consumer = %delivery_to.id(), rebind = self.delivery_to.is_some(), "Consumer bound");
                self.delivery_to = Some(delivery_to);
                if let Some(in_flight) = self.in_flight.take() {
                    debug!(seq_nr = %in_flight.seq_nr, "Redelivering in-flight message to new consumer");
                    self.dispatch(ctx, in_flight);
                }
                self.drain_buffer(ctx)?;
                self.unstash(ctx)?;
            }
            ConsumerCommand::RegisterToProducerController { producer_controller } => {
                if self.registered_to.as_ref() != Some(producer_controller.id()) {
                    self.registered_to = Some(producer_controller.id().clone());
                    producer_controller.tell(ProducerCommand::RegisterConsumer {
                        consumer_controller: ctx.self_ref().adapt(ConsumerCommand::Sequenced),
                    });
                }
            }
            ConsumerCommand::Sequenced(msg) => self.on_sequenced(ctx, msg)?,
            ConsumerCommand::Confirmed { seq_nr } => self.on_confirmed(ctx, seq_nr)?,
            ConsumerCommand::Retry => self.on_retry(ctx),
            ConsumerCommand::DeliverThenStop => {
                debug!(busy = self.is_busy(), "Deliver then stop requested");
                self.stopping = true;
                self.check_stop(ctx);
            }
            ConsumerCommand::Handoff { reply_to } => {
                let handoff = self.take_handoff();
                info!(
                    confirmed_seq_nr = %handoff.confirmed_seq_nr,
                    buffered = handoff.buffer.len(),
                    "Handing off consumer controller state"
                );
                let _ = reply_to.send(handoff);
                ctx.stop();
            }
        }
        Ok(())
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<ConsumerCommand<T>>) -> Result<()> {
        let interval = self.retry_interval;
        ctx.timers().start_single_timer(RETRY_TIMER, ConsumerCommand::Retry, interval);
        debug!(
            window = self.settings.flow_control_window,
            only_flow_control = self.settings.only_flow_control,
            handoff = self.binding.is_some(),
            "Consumer controller started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<ConsumerCommand<T>>) {
        info!(
            producer_id = ?self.binding.as_ref().map(|b| b.producer_id.clone()),
            confirmed_seq_nr = %self.confirmed_seq_nr,
            "Consumer controller stopped"
        );
    }

    async fn on_error(&mut self, error: &DeliveryError) -> SupervisorDirective {
        error!(category = error.category(), %error, "Consumer controller failed");
        if error.is_fatal() {
            SupervisorDirective::Stop
        } else {
            SupervisorDirective::Restart
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{split_into_chunks, BincodeCodec};
    use delivery_actors::testkit::TestProbe;
    use tracing_test::traced_test;

    fn settings(window: u32) -> ConsumerControllerSettings {
        ConsumerControllerSettings {
            flow_control_window: window,
            resend_interval_min: Duration::from_secs(60),
            resend_interval_max: Duration::from_secs(60),
            only_flow_control: false,
        }
    }

    struct Producer {
        incarnation: Incarnation,
        feedback: TestProbe<ProducerFeedback>,
    }

    impl Producer {
        fn new() -> Self {
            Self {
                incarnation: Incarnation::new(),
                feedback: TestProbe::new(),
            }
        }

        fn message(&self, seq: i64, first: bool) -> ConsumerCommand<String> {
            self.wrap(seq, first, MessageOrChunk::Message(format!("m{}", seq)))
        }

        fn wrap(&self, seq: i64, first: bool, message: MessageOrChunk<String>) -> ConsumerCommand<String> {
            ConsumerCommand::Sequenced(SequencedMessage {
                producer_id: "producer".to_string(),
                incarnation: self.incarnation,
                seq_nr: SeqNo::new(seq),
                message,
                first,
                ack: false,
                feedback_to: self.feedback.recipient(),
            })
        }

        fn request(&self, confirmed: i64, up_to: i64) -> ProducerFeedback {
            ProducerFeedback::Request {
                incarnation: self.incarnation,
                confirmed_seq_nr: SeqNo::new(confirmed),
                request_up_to_seq_nr: SeqNo::new(up_to),
                support_resend: true,
                via_timeout: false,
            }
        }
    }

    fn start(
        system: &ActorSystem,
        controller: ConsumerController<String>,
    ) -> (ActorRef<ConsumerCommand<String>>, TestProbe<Delivery<String>>) {
        let consumer = TestProbe::new();
        let cc = controller.spawn(system, "consumer-controller");
        cc.tell(ConsumerCommand::Start {
            delivery_to: consumer.recipient(),
        });
        (cc, consumer)
    }

    #[tokio::test]
    async fn test_binds_and_requests_in_windows() {
        let system = ActorSystem::new("test");
        let (cc, mut consumer) = start(&system, ConsumerController::new(settings(4)));
        let mut producer = Producer::new();

        cc.tell(producer.message(1, true));
        assert_eq!(producer.feedback.expect_message().await, producer.request(0, 4));
        let delivery = consumer.expect_message().await;
        assert_eq!(delivery.message, "m1");
        delivery.confirm();

        cc.tell(producer.message(2, false));
        let delivery = consumer.expect_message().await;
        assert_eq!(delivery.seq_nr, SeqNo::new(2));
        delivery.confirm();

        // half the window used up
        assert_eq!(producer.feedback.expect_message().await, producer.request(2, 6));
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_nacks_gaps() {
        let system = ActorSystem::new("test");
        let (cc, mut consumer) = start(&system, ConsumerController::new(settings(8)));
        let mut producer = Producer::new();

        cc.tell(producer.message(1, true));
        cc.tell(producer.message(3, false));
        producer.feedback.expect_message().await;
        assert_eq!(
            producer.feedback.expect_message().await,
            ProducerFeedback::Ack {
                incarnation: producer.incarnation,
                ack: Ack::new(SeqNo::ZERO, [SeqNo::new(2)]),
            }
        );

        consumer.expect_message().await.confirm();
        consumer.expect_no_message(Duration::from_millis(50)).await;

        cc.tell(producer.message(2, false));
        for expected in ["m2", "m3"] {
            let delivery = consumer.expect_message().await;
            assert_eq!(delivery.message, expected);
            delivery.confirm();
        }
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let system = ActorSystem::new("test");
        let (cc, mut consumer) = start(&system, ConsumerController::new(settings(4)));
        let mut producer = Producer::new();

        cc.tell(producer.message(1, true));
        consumer.expect_message().await.confirm();
        cc.tell(producer.message(1, true));

        producer.feedback.expect_message().await;
        // the duplicate is re-acknowledged
        assert_eq!(producer.feedback.expect_message().await, producer.request(1, 4));
        consumer.expect_no_message(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_message_beyond_requested_window_is_dropped() {
        let system = ActorSystem::new("test");
        let (cc, mut consumer) = start(&system, ConsumerController::new(settings(4)));
        let mut producer = Producer::new();

        cc.tell(producer.message(1, true));
        assert_eq!(producer.feedback.expect_message().await, producer.request(0, 4));
        consumer.expect_message().await.confirm();

        cc.tell(producer.message(1_000_000_000, false));
        cc.tell(producer.message(5, false));
        producer.feedback.expect_no_message(Duration::from_millis(100)).await;
        consumer.expect_no_message(Duration::from_millis(50)).await;

        // still inside the window
        cc.tell(producer.message(2, false));
        let delivery = consumer.expect_message().await;
        assert_eq!(delivery.seq_nr, SeqNo::new(2));
        delivery.confirm();
        assert_eq!(producer.feedback.expect_message().await, producer.request(2, 6));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stash_overflow_is_logged_as_warning() {
        let system = ActorSystem::new("test");
        let cc = ConsumerController::new(settings(2)).spawn(&system, "consumer-controller");
        let producer = Producer::new();
        for seq in 1..=3 {
            cc.tell(producer.message(seq, seq == 1));
        }

        let (delivery_tx, mut deliveries) = tokio::sync::mpsc::unbounded_channel::<Delivery<String>>();
        cc.tell(ConsumerCommand::Start {
            delivery_to: Recipient::from_channel(delivery_tx),
        });
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.message, "m1");
        delivery.confirm();
        let delivery = tokio::time::timeout(Duration::from_secs(3), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message, "m2");

        logs_assert(|lines: &[&str]| {
            let dropped: Vec<&&str> = lines
                .iter()
                .filter(|line| line.contains("Stash full, dropping message"))
                .collect();
            match dropped.as_slice() {
                [line] if line.contains("WARN") => Ok(()),
                other => Err(format!("expected one warning for the dropped message, got {:?}", other)),
            }
        });
    }

    #[tokio::test]
    async fn test_unknown_producer_without_first_asks_for_resend() {
        let system = ActorSystem::new("test");
        let (cc, mut consumer) = start(&system, ConsumerController::new(settings(4)));
        let mut producer = Producer::new();

        cc.tell(producer.message(5, false));
        assert_eq!(
            producer.feedback.expect_message().await,
            ProducerFeedback::Request {
                incarnation: producer.incarnation,
                confirmed_seq_nr: SeqNo::ZERO,
                request_up_to_seq_nr: SeqNo::new(4),
                support_resend: true,
                via_timeout: true,
            }
        );
        consumer.expect_no_message(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_new_incarnation_waits_for_current_message() {
        let system = ActorSystem::new("test");
        let (cc, mut consumer) = start(&system, ConsumerController::new(settings(4)));
        let old = Producer::new();
        let restarted = Producer::new();

        cc.tell(old.message(1, true));
        let delivery = consumer.expect_message().await;
        cc.tell(restarted.message(1, true));
        consumer.expect_no_message(Duration::from_millis(50)).await;

        delivery.confirm();
        let delivery = consumer.expect_message().await;
        assert_eq!(delivery.seq_nr, SeqNo::new(1));
        assert_eq!(delivery.message, "m1");
    }

    #[tokio::test]
    async fn test_reassembles_chunks() {
        let system = ActorSystem::new("test");
        let codec = Arc::new(BincodeCodec::<String>::new());
        let controller = ConsumerController::new(settings(16)).with_codec(codec.clone());
        let (cc, mut consumer) = start(&system, controller);
        let producer = Producer::new();

        let text = "a message that needs several chunks".to_string();
        let chunks = split_into_chunks(codec.encode(&text).unwrap(), 8);
        assert!(chunks.len() > 2);
        let last = chunks.len() as i64;
        for (i, chunk) in chunks.into_iter().enumerate() {
            cc.tell(producer.wrap(i as i64 + 1, i == 0, MessageOrChunk::Chunk(chunk)));
        }

        let delivery = consumer.expect_message().await;
        assert_eq!(delivery.message, text);
        assert_eq!(delivery.seq_nr, SeqNo::new(last));
    }

    #[tokio::test]
    async fn test_handoff_redelivers_unconfirmed() {
        let system = ActorSystem::new("test");
        let (cc, mut consumer) = start(&system, ConsumerController::new(settings(4)));
        let producer = Producer::new();

        for seq in 1..=3 {
            cc.tell(producer.message(seq, seq == 1));
        }
        consumer.expect_message().await;

        let (reply_to, reply) = oneshot::channel();
        cc.tell(ConsumerCommand::Handoff { reply_to });
        let handoff = reply.await.unwrap();
        assert_eq!(handoff.confirmed_seq_nr, SeqNo::ZERO);
        assert_eq!(handoff.buffer.len(), 3);
        cc.terminated().await;

        let replacement = ConsumerController::new(settings(4)).with_handoff(handoff);
        let (_cc, mut consumer) = start(&system, replacement);
        for expected in 1..=3 {
            let delivery = consumer.expect_message().await;
            assert_eq!(delivery.seq_nr, SeqNo::new(expected));
            delivery.confirm();
        }
    }

    #[tokio::test]
    async fn test_deliver_then_stop() {
        let system = ActorSystem::new("test");
        let (cc, mut consumer) = start(&system, ConsumerController::new(settings(4)));
        let producer = Producer::new();

        cc.tell(producer.message(1, true));
        cc.tell(ConsumerCommand::DeliverThenStop);
        let delivery = consumer.expect_message().await;
        assert!(!cc.is_terminated());

        delivery.confirm();
        tokio::time::timeout(Duration::from_secs(3), cc.terminated())
            .await
            .unwrap();
    }
}
