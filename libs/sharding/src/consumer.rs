//! Sharding consumer controller
//!
//! Sits in front of the entities of one region. Every producer sending to an
//! entity gets its own inner [`ConsumerController`], spawned on the first
//! sequenced message, so ordering and flow control stay per producer while
//! the entity sees one stream of [`Delivery`] messages.

use crate::envelope::{EntityId, ShardingEnvelope};
use crate::error::{Result, ShardingError};
use crate::settings::ShardingConsumerSettings;
use async_trait::async_trait;
use delivery_actors::{ActorBehavior, ActorContext, ActorRef, ActorSystem, Recipient, SupervisorDirective};
use reliable_delivery::{ConsumerCommand, ConsumerController, Delivery, MessageCodec, SequencedMessage};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

pub enum ShardingConsumerCommand<T> {
    Envelope(ShardingEnvelope<SequencedMessage<T>>),
    /// Finish what was handed to the entity, then retire its controllers
    Passivate {
        entity_id: EntityId,
    },
    ControllerTerminated {
        entity_id: EntityId,
        producer_id: String,
        generation: u64,
    },
}

impl<T> fmt::Debug for ShardingConsumerCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingConsumerCommand::Envelope(env) => write!(
                f,
                "Envelope({}, {}, {})",
                env.entity_id, env.message.producer_id, env.message.seq_nr
            ),
            ShardingConsumerCommand::Passivate { entity_id } => write!(f, "Passivate({})", entity_id),
            ShardingConsumerCommand::ControllerTerminated {
                entity_id, producer_id, ..
            } => write!(f, "ControllerTerminated({}, {})", entity_id, producer_id),
        }
    }
}

type ConsumerFactory<T> = Arc<dyn Fn(&EntityId) -> Recipient<Delivery<T>> + Send + Sync>;

struct Inner<T> {
    generation: u64,
    controller: ActorRef<ConsumerCommand<T>>,
}

pub struct ShardingConsumerController<T> {
    settings: ShardingConsumerSettings,
    factory: ConsumerFactory<T>,
    codec: Option<Arc<dyn MessageCodec<T>>>,
    consumers: HashMap<EntityId, Recipient<Delivery<T>>>,
    controllers: HashMap<(EntityId, String), Inner<T>>,
    next_generation: u64,
}

impl<T: Clone + Send + 'static> ShardingConsumerController<T> {
    /// `factory` yields the consumer of an entity the first time it receives
    /// a message (again after passivation).
    pub fn new<F>(settings: ShardingConsumerSettings, factory: F) -> Self
    where
        F: Fn(&EntityId) -> Recipient<Delivery<T>> + Send + Sync + 'static,
    {
        Self {
            settings,
            factory: Arc::new(factory),
            codec: None,
            consumers: HashMap::new(),
            controllers: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec<T>>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn spawn(self, system: &ActorSystem, name: impl Into<String>) -> ActorRef<ShardingConsumerCommand<T>> {
        system.spawn(name, self)
    }

    fn on_envelope(
        &mut self,
        ctx: &mut ActorContext<ShardingConsumerCommand<T>>,
        envelope: ShardingEnvelope<SequencedMessage<T>>,
    ) {
        let ShardingEnvelope { entity_id, message } = envelope;
        let key = (entity_id, message.producer_id.clone());
        if !self.controllers.contains_key(&key) {
            let inner = self.spawn_controller(ctx, &key.0, &key.1);
            self.controllers.insert(key.clone(), inner);
        }
        if let Some(inner) = self.controllers.get(&key) {
            trace!(entity_id = %key.0, producer_id = %key.1, seq_nr = %message.seq_nr, "Forwarding to consumer controller");
            inner.controller.tell(ConsumerCommand::Sequenced(message));
        }
    }

    fn spawn_controller(
        &mut self,
        ctx: &mut ActorContext<ShardingConsumerCommand<T>>,
        entity_id: &EntityId,
        producer_id: &str,
    ) -> Inner<T> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let mut consumer_controller = ConsumerController::new(self.settings.consumer_controller.clone());
        if let Some(codec) = &self.codec {
            consumer_controller = consumer_controller.with_codec(Arc::clone(codec));
        }
        let controller = consumer_controller.spawn(
            ctx.system(),
            format!("consumer-controller-{}-{}", entity_id, producer_id),
        );

        let factory = Arc::clone(&self.factory);
        let delivery_to = self
            .consumers
            .entry(entity_id.clone())
            .or_insert_with(|| factory(entity_id))
            .clone();
        controller.tell(ConsumerCommand::Start { delivery_to });

        ctx.watch_with(
            controller.terminated(),
            ShardingConsumerCommand::ControllerTerminated {
                entity_id: entity_id.clone(),
                producer_id: producer_id.to_string(),
                generation,
            },
        );
        debug!(%entity_id, %producer_id, generation, "Started consumer controller");

        Inner { generation, controller }
    }

    fn passivate(&mut self, entity_id: EntityId) {
        let keys: Vec<(EntityId, String)> = self
            .controllers
            .keys()
            .filter(|(entity, _)| *entity == entity_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(inner) = self.controllers.remove(key) {
                inner.controller.tell(ConsumerCommand::DeliverThenStop);
            }
        }
        self.consumers.remove(&entity_id);
        debug!(%entity_id, controllers = keys.len(), "Passivating entity");
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> ActorBehavior for ShardingConsumerController<T> {
    type Message = ShardingConsumerCommand<T>;
    type Error = ShardingError;

    async fn handle(
        &mut self,
        ctx: &mut ActorContext<ShardingConsumerCommand<T>>,
        msg: ShardingConsumerCommand<T>,
    ) -> Result<()> {
        match msg {
            ShardingConsumerCommand::Envelope(envelope) => self.on_envelope(ctx, envelope),
            ShardingConsumerCommand::Passivate { entity_id } => self.passivate(entity_id),
            ShardingConsumerCommand::ControllerTerminated {
                entity_id,
                producer_id,
                generation,
            } => {
                let key = (entity_id, producer_id);
                if self.controllers.get(&key).is_some_and(|i| i.generation == generation) {
                    debug!(entity_id = %key.0, producer_id = %key.1, "Consumer controller terminated");
                    self.controllers.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<ShardingConsumerCommand<T>>) {
        for (_, inner) in self.controllers.drain() {
            inner.controller.stop();
        }
        info!(entities = self.consumers.len(), "Sharding consumer controller stopped");
    }

    async fn on_error(&mut self, error: &ShardingError) -> SupervisorDirective {
        error!(category = error.category(), %error, "Sharding consumer controller failed");
        SupervisorDirective::Stop
    }
}
