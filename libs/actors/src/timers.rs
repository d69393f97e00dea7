//! Keyed timers that re-inject messages into the owning actor's mailbox.
//!
//! Starting a timer under a key that is already active replaces it. Every
//! scheduled message carries the generation it was started with; the actor
//! loop discards timer messages whose generation is no longer current, so a
//! cancelled or replaced timer never delivers even if its message was already
//! enqueued.

use crate::actor_ref::{ActorRef, Envelope};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

struct Timer {
    generation: u64,
    periodic: bool,
    handle: JoinHandle<()>,
}

pub struct TimerScheduler<M> {
    owner: ActorRef<M>,
    timers: HashMap<String, Timer>,
    next_generation: u64,
}

impl<M: Send + 'static> TimerScheduler<M> {
    pub(crate) fn new(owner: ActorRef<M>) -> Self {
        Self {
            owner,
            timers: HashMap::new(),
            next_generation: 0,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Deliver `msg` once after `delay`.
    pub fn start_single_timer(&mut self, key: impl Into<String>, msg: M, delay: Duration) {
        let key = key.into();
        self.cancel(&key);
        let generation = self.next_generation();
        let owner = self.owner.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            owner.send_envelope(Envelope::Timer {
                key: timer_key,
                generation,
                msg,
            });
        });
        trace!(actor_id = %self.owner.id(), timer = %key, delay_ms = delay.as_millis() as u64, "Single timer started");
        self.timers.insert(
            key,
            Timer {
                generation,
                periodic: false,
                handle,
            },
        );
    }

    /// Deliver a message produced by `make` every `interval`, first after one interval.
    pub fn start_periodic_timer<F>(&mut self, key: impl Into<String>, interval: Duration, make: F)
    where
        F: Fn() -> M + Send + 'static,
    {
        let key = key.into();
        self.cancel(&key);
        let generation = self.next_generation();
        let owner = self.owner.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let delivered = owner.send_envelope(Envelope::Timer {
                    key: timer_key.clone(),
                    generation,
                    msg: make(),
                });
                if !delivered {
                    break;
                }
            }
        });
        trace!(actor_id = %self.owner.id(), timer = %key, interval_ms = interval.as_millis() as u64, "Periodic timer started");
        self.timers.insert(
            key,
            Timer {
                generation,
                periodic: true,
                handle,
            },
        );
    }

    pub fn is_timer_active(&self, key: &str) -> bool {
        self.timers.contains_key(key)
    }

    pub fn cancel(&mut self, key: &str) {
        if let Some(timer) = self.timers.remove(key) {
            timer.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }

    /// Whether a timer message is still current. Accepting a single timer
    /// retires it.
    pub(crate) fn accept(&mut self, key: &str, generation: u64) -> bool {
        match self.timers.get(key) {
            Some(timer) if timer.generation == generation => {
                if !timer.periodic {
                    self.timers.remove(key);
                }
                true
            }
            _ => {
                trace!(actor_id = %self.owner.id(), timer = %key, generation, "Discarding stale timer message");
                false
            }
        }
    }
}

impl<M> Drop for TimerScheduler<M> {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}
