//! Actor System Core
//!
//! Lifecycle management and supervision for the single-threaded,
//! message-driven state machines that host the delivery controllers. Each
//! actor is one tokio task owning its behavior exclusively and draining an
//! unbounded mailbox sequentially, so behaviors never need locks.
//!
//! ## Supervision
//! - A handler error is passed to [`ActorBehavior::on_error`], which picks a
//!   [`SupervisorDirective`].
//! - `Restart` is bounded by [`SupervisionStrategy`]: at most `max_restarts`
//!   within `restart_window`, each preceded by an exponential backoff.
//! - Exceeding the limit, `Stop` and `Escalate` terminate the actor with a
//!   `Failed` status that watchers observe.
//!
//! # Lock Ordering
//!
//! The only lock is the system's task registry; it is never held across an
//! await point.

use crate::actor_ref::{ActorId, ActorRef, ActorStatus, Envelope};
use crate::error::ActorError;
use crate::timers::TimerScheduler;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// System-wide metrics
#[derive(Debug, Default)]
pub struct SystemMetrics {
    pub actors_spawned: AtomicU64,
    pub actors_stopped: AtomicU64,
    pub actors_failed: AtomicU64,
    pub messages_processed: AtomicU64,
    pub total_processing_time_ns: AtomicU64,
    pub actor_restarts: AtomicU64,
    pub restart_failures: AtomicU64,
}

impl SystemMetrics {
    pub fn record_message_handled(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let count = self.messages_processed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_processing_time_ns.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    /// Record actor restart event
    pub fn record_actor_restart(&self, success: bool) {
        self.actor_restarts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.restart_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SystemStats {
        SystemStats {
            actors_spawned: self.actors_spawned.load(Ordering::Relaxed),
            actors_stopped: self.actors_stopped.load(Ordering::Relaxed),
            actors_failed: self.actors_failed.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            avg_processing_time_ns: self.avg_processing_time_ns(),
            actor_restarts: self.actor_restarts.load(Ordering::Relaxed),
            restart_failures: self.restart_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemStats {
    pub actors_spawned: u64,
    pub actors_stopped: u64,
    pub actors_failed: u64,
    pub messages_processed: u64,
    pub avg_processing_time_ns: f64,
    pub actor_restarts: u64,
    pub restart_failures: u64,
}

/// Restart limits and backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionStrategy {
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SupervisionStrategy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Restart bookkeeping for one actor
#[derive(Debug)]
struct SupervisionContext {
    strategy: SupervisionStrategy,
    restart_count: u32,
    restart_window_start: Option<Instant>,
}

impl SupervisionContext {
    fn new(strategy: SupervisionStrategy) -> Self {
        Self {
            strategy,
            restart_count: 0,
            restart_window_start: None,
        }
    }

    /// Check if actor can be restarted or should be stopped
    fn should_restart(&mut self) -> bool {
        let now = Instant::now();
        match self.restart_window_start {
            Some(start) if now.duration_since(start) <= self.strategy.restart_window => {
                self.restart_count += 1;
                self.restart_count <= self.strategy.max_restarts
            }
            _ => {
                self.restart_window_start = Some(now);
                self.restart_count = 1;
                self.restart_count <= self.strategy.max_restarts
            }
        }
    }

    fn backoff(&self) -> Duration {
        let exponent = self.restart_count.saturating_sub(1).min(16);
        let backoff = self.strategy.min_backoff.saturating_mul(1u32 << exponent);
        backoff.min(self.strategy.max_backoff)
    }
}

/// Supervision directive for error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorDirective {
    /// Resume processing
    Resume,
    /// Restart the actor
    Restart,
    /// Stop the actor
    Stop,
    /// Escalate to parent supervisor
    Escalate,
}

/// Trait for actor behavior
#[async_trait]
pub trait ActorBehavior: Send + 'static {
    type Message: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Handle incoming message
    async fn handle(
        &mut self,
        ctx: &mut ActorContext<Self::Message>,
        msg: Self::Message,
    ) -> Result<(), Self::Error>;

    /// Called when actor starts, and again after every restart
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called before `on_start` when the actor is restarted
    async fn pre_restart(&mut self, _ctx: &mut ActorContext<Self::Message>) {}

    /// Called before actor stops
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}

    /// Handle failure - return supervision directive
    async fn on_error(&mut self, error: &Self::Error) -> SupervisorDirective {
        error!("Actor error: {}", error);
        SupervisorDirective::Restart
    }
}

/// Per-actor handle passed to every behavior callback
pub struct ActorContext<M> {
    self_ref: ActorRef<M>,
    system: ActorSystem,
    timers: TimerScheduler<M>,
    stop_requested: bool,
}

impl<M: Send + 'static> ActorContext<M> {
    fn new(self_ref: ActorRef<M>, system: ActorSystem) -> Self {
        let timers = TimerScheduler::new(self_ref.clone());
        Self {
            self_ref,
            system,
            timers,
            stop_requested: false,
        }
    }

    pub fn self_ref(&self) -> &ActorRef<M> {
        &self.self_ref
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    pub fn timers(&mut self) -> &mut TimerScheduler<M> {
        &mut self.timers
    }

    /// Stop after the current message.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Run `future` off the actor task and deliver its converted result as a
    /// message, so the actor keeps processing its mailbox meanwhile.
    pub fn pipe_to_self<F, R, C>(&self, future: F, convert: C)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
        C: FnOnce(R) -> M + Send + 'static,
    {
        let me = self.self_ref.clone();
        tokio::spawn(async move {
            let result = future.await;
            me.tell(convert(result));
        });
    }

    /// Deliver `msg` once `termination` resolves, e.g. `child.terminated()`.
    pub fn watch_with<W>(&self, termination: W, msg: M)
    where
        W: Future<Output = ActorStatus> + Send + 'static,
    {
        let me = self.self_ref.clone();
        tokio::spawn(async move {
            termination.await;
            me.tell(msg);
        });
    }
}

struct TaskEntry {
    name: Arc<str>,
    stop: Box<dyn Fn() + Send + Sync>,
    handle: JoinHandle<()>,
}

struct SystemInner {
    name: String,
    tasks: Mutex<HashMap<ActorId, TaskEntry>>,
    metrics: Arc<SystemMetrics>,
    supervision: SupervisionStrategy,
}

/// Owns the actor tasks spawned through it
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

impl ActorSystem {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_supervision(name, SupervisionStrategy::default())
    }

    /// System whose actors default to `supervision`
    pub fn with_supervision(name: impl Into<String>, supervision: SupervisionStrategy) -> Self {
        let name = name.into();
        info!(system = %name, "Creating new actor system");
        Self {
            inner: Arc::new(SystemInner {
                name,
                tasks: Mutex::new(HashMap::new()),
                metrics: Arc::new(SystemMetrics::default()),
                supervision,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn metrics(&self) -> Arc<SystemMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn active_actors(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Spawn a new actor with the system's default supervision
    pub fn spawn<A>(&self, name: impl Into<String>, behavior: A) -> ActorRef<A::Message>
    where
        A: ActorBehavior,
    {
        self.spawn_with_supervision(name, behavior, self.inner.supervision.clone())
    }

    pub fn spawn_with_supervision<A>(
        &self,
        name: impl Into<String>,
        behavior: A,
        supervision: SupervisionStrategy,
    ) -> ActorRef<A::Message>
    where
        A: ActorBehavior,
    {
        let id = ActorId::new();
        let name: Arc<str> = Arc::from(name.into());
        let (sender, receiver) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ActorStatus::Starting);
        let actor_ref = ActorRef::new(id.clone(), Arc::clone(&name), sender, status_rx);

        debug!(
            actor_id = %id,
            actor = %name,
            system = %self.inner.name,
            actor_type = std::any::type_name::<A>(),
            "Spawning new actor in system"
        );

        let task = ActorTask {
            id: id.clone(),
            name: Arc::clone(&name),
            behavior,
            receiver,
            ctx: ActorContext::new(actor_ref.clone(), self.clone()),
            status: status_tx,
            metrics: Arc::clone(&self.inner.metrics),
            supervision: SupervisionContext::new(supervision),
        };

        let stopper = actor_ref.clone();
        // Registry lock is held across spawn so the task cannot deregister first
        let mut tasks = self.inner.tasks.lock();
        let handle = tokio::spawn(task.run());
        tasks.insert(
            id,
            TaskEntry {
                name,
                stop: Box::new(move || stopper.stop()),
                handle,
            },
        );
        self.inner.metrics.actors_spawned.fetch_add(1, Ordering::Relaxed);

        actor_ref
    }

    fn deregister(&self, id: &ActorId) {
        self.inner.tasks.lock().remove(id);
    }

    /// Ask every actor to stop and wait up to `grace` for them, aborting the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let entries: Vec<(ActorId, TaskEntry)> = self.inner.tasks.lock().drain().collect();
        info!(system = %self.inner.name, actors = entries.len(), "Shutting down actor system");

        for (_, entry) in &entries {
            (entry.stop)();
        }

        let deadline = tokio::time::Instant::now() + grace;
        for (id, entry) in entries {
            let mut handle = entry.handle;
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(actor_id = %id, actor = %entry.name, error = %e, "Actor task finished with error"),
                Err(_) => {
                    warn!(actor_id = %id, actor = %entry.name, "Actor did not stop within grace period, aborting");
                    handle.abort();
                }
            }
        }
    }
}

/// Actor task runner
struct ActorTask<A: ActorBehavior> {
    id: ActorId,
    name: Arc<str>,
    behavior: A,
    receiver: mpsc::UnboundedReceiver<Envelope<A::Message>>,
    ctx: ActorContext<A::Message>,
    status: watch::Sender<ActorStatus>,
    metrics: Arc<SystemMetrics>,
    supervision: SupervisionContext,
}

impl<A: ActorBehavior> ActorTask<A> {
    async fn run(mut self) {
        let task_start = Instant::now();
        debug!(actor_id = %self.id, actor = %self.name, "Starting actor task execution");

        let mut failure = self.start().await.err();

        if failure.is_none() {
            self.status.send_replace(ActorStatus::Running);
            debug!(
                actor_id = %self.id,
                actor = %self.name,
                startup_duration_ms = task_start.elapsed().as_millis() as u64,
                "Actor successfully started, entering message loop"
            );

            while !self.ctx.stop_requested {
                let Some(envelope) = self.receiver.recv().await else {
                    break;
                };
                let msg = match envelope {
                    Envelope::Message(msg) => msg,
                    Envelope::Timer { key, generation, msg } => {
                        if !self.ctx.timers.accept(&key, generation) {
                            continue;
                        }
                        msg
                    }
                    Envelope::Stop => {
                        debug!(actor_id = %self.id, actor = %self.name, "Stop requested");
                        break;
                    }
                };

                let start = Instant::now();
                match self.behavior.handle(&mut self.ctx, msg).await {
                    Ok(()) => self.metrics.record_message_handled(start.elapsed()),
                    Err(e) => {
                        error!(
                            actor_id = %self.id,
                            actor = %self.name,
                            error = %e,
                            processing_duration_ns = start.elapsed().as_nanos() as u64,
                            "Actor message processing failed"
                        );
                        if let Err(reason) = self.supervise(e).await {
                            failure = Some(reason);
                            break;
                        }
                    }
                }
            }
        }

        // Lifecycle: Stop
        self.ctx.timers.cancel_all();
        self.behavior.on_stop(&mut self.ctx).await;

        let final_status = match failure {
            Some(reason) => {
                self.metrics.actors_failed.fetch_add(1, Ordering::Relaxed);
                ActorStatus::Failed { reason }
            }
            None => ActorStatus::Stopped,
        };
        self.metrics.actors_stopped.fetch_add(1, Ordering::Relaxed);
        self.ctx.system.deregister(&self.id);

        info!(
            actor_id = %self.id,
            actor = %self.name,
            status = ?final_status,
            total_runtime_ms = task_start.elapsed().as_millis() as u64,
            "Actor task execution completed"
        );
        self.status.send_replace(final_status);
    }

    /// Run `on_start`, restarting within limits when it fails.
    async fn start(&mut self) -> Result<(), String> {
        loop {
            let err = match self.behavior.on_start(&mut self.ctx).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            error!(actor_id = %self.id, actor = %self.name, error = %err, "Actor failed to start");

            let directive = self.behavior.on_error(&err).await;
            if directive != SupervisorDirective::Restart || !self.supervision.should_restart() {
                if directive == SupervisorDirective::Restart {
                    self.metrics.record_actor_restart(false);
                }
                return Err(ActorError::StartupFailed {
                    name: self.name.to_string(),
                    reason: err.to_string(),
                }
                .to_string());
            }
            self.metrics.record_actor_restart(true);
            self.prepare_restart().await;
        }
    }

    async fn prepare_restart(&mut self) {
        self.status.send_replace(ActorStatus::Restarting);
        self.ctx.timers.cancel_all();
        let backoff = self.supervision.backoff();
        warn!(
            actor_id = %self.id,
            actor = %self.name,
            restart_count = self.supervision.restart_count,
            max_restarts = self.supervision.strategy.max_restarts,
            backoff_ms = backoff.as_millis() as u64,
            "Restarting actor within restart limits"
        );
        tokio::time::sleep(backoff).await;
        self.behavior.pre_restart(&mut self.ctx).await;
    }

    /// Apply the behavior's directive. `Err` carries the terminal failure reason.
    async fn supervise(&mut self, error: A::Error) -> Result<(), String> {
        match self.behavior.on_error(&error).await {
            SupervisorDirective::Resume => {
                debug!(actor_id = %self.id, directive = "Resume", "Actor resumed after error");
                Ok(())
            }
            SupervisorDirective::Restart => {
                if !self.supervision.should_restart() {
                    error!(
                        actor_id = %self.id,
                        actor = %self.name,
                        restart_count = self.supervision.restart_count,
                        max_restarts = self.supervision.strategy.max_restarts,
                        "Actor exceeded restart limit"
                    );
                    self.metrics.record_actor_restart(false);
                    return Err(error.to_string());
                }
                self.metrics.record_actor_restart(true);
                self.prepare_restart().await;
                self.start().await?;
                self.status.send_replace(ActorStatus::Running);
                info!(actor_id = %self.id, actor = %self.name, "Actor restarted");
                Ok(())
            }
            SupervisorDirective::Stop => {
                warn!(actor_id = %self.id, actor = %self.name, directive = "Stop", error = %error, "Stopping actor due to error directive");
                Err(error.to_string())
            }
            SupervisorDirective::Escalate => {
                error!(
                    actor_id = %self.id,
                    actor = %self.name,
                    error = %error,
                    "Root actor error - no parent to escalate to, stopping"
                );
                Err(error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestProbe;
    use crate::Recipient;
    use std::fmt;

    #[derive(Debug)]
    struct Boom(&'static str);

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom: {}", self.0)
        }
    }

    impl std::error::Error for Boom {}

    #[derive(Debug)]
    enum CounterMsg {
        Add(u32),
        Fail,
        Report,
        Later(u32, Duration),
        CancelLater,
        Stop,
    }

    struct Counter {
        total: u32,
        starts: u32,
        directive: SupervisorDirective,
        report_to: Recipient<(u32, u32)>,
    }

    #[async_trait]
    impl ActorBehavior for Counter {
        type Message = CounterMsg;
        type Error = Boom;

        async fn handle(&mut self, ctx: &mut ActorContext<CounterMsg>, msg: CounterMsg) -> Result<(), Boom> {
            match msg {
                CounterMsg::Add(n) => self.total += n,
                CounterMsg::Fail => return Err(Boom("requested")),
                CounterMsg::Report => {
                    self.report_to.tell((self.total, self.starts));
                }
                CounterMsg::Later(n, delay) => {
                    ctx.timers().start_single_timer("later", CounterMsg::Add(n), delay);
                }
                CounterMsg::CancelLater => ctx.timers().cancel("later"),
                CounterMsg::Stop => ctx.stop(),
            }
            Ok(())
        }

        async fn on_start(&mut self, _ctx: &mut ActorContext<CounterMsg>) -> Result<(), Boom> {
            self.starts += 1;
            Ok(())
        }

        async fn pre_restart(&mut self, _ctx: &mut ActorContext<CounterMsg>) {
            self.total = 0;
        }

        async fn on_error(&mut self, _error: &Boom) -> SupervisorDirective {
            self.directive
        }
    }

    fn counter(directive: SupervisorDirective, probe: &TestProbe<(u32, u32)>) -> Counter {
        Counter {
            total: 0,
            starts: 0,
            directive,
            report_to: probe.recipient(),
        }
    }

    fn fast_supervision(max_restarts: u32) -> SupervisionStrategy {
        SupervisionStrategy {
            max_restarts,
            restart_window: Duration::from_secs(60),
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_messages_processed_in_order() {
        let system = ActorSystem::new("test");
        let mut probe = TestProbe::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Resume, &probe));

        actor.tell(CounterMsg::Add(2));
        actor.tell(CounterMsg::Add(3));
        actor.tell(CounterMsg::Report);

        assert_eq!(probe.expect_message().await, (5, 1));
        assert!(system.metrics().snapshot().messages_processed >= 3);
    }

    #[tokio::test]
    async fn test_resume_keeps_state() {
        let system = ActorSystem::new("test");
        let mut probe = TestProbe::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Resume, &probe));

        actor.tell(CounterMsg::Add(4));
        actor.tell(CounterMsg::Fail);
        actor.tell(CounterMsg::Report);

        assert_eq!(probe.expect_message().await, (4, 1));
    }

    #[tokio::test]
    async fn test_restart_resets_state_and_runs_on_start() {
        let system = ActorSystem::with_supervision("test", fast_supervision(3));
        let mut probe = TestProbe::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Restart, &probe));

        actor.tell(CounterMsg::Add(4));
        actor.tell(CounterMsg::Fail);
        actor.tell(CounterMsg::Add(1));
        actor.tell(CounterMsg::Report);

        assert_eq!(probe.expect_message().await, (1, 2));
        assert_eq!(system.metrics().snapshot().actor_restarts, 1);
    }

    #[tokio::test]
    async fn test_restart_limit_fails_actor() {
        let system = ActorSystem::with_supervision("test", fast_supervision(1));
        let probe = TestProbe::<(u32, u32)>::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Restart, &probe));

        actor.tell(CounterMsg::Fail);
        actor.tell(CounterMsg::Fail);

        let status = tokio::time::timeout(Duration::from_secs(2), actor.terminated())
            .await
            .unwrap();
        assert!(matches!(status, ActorStatus::Failed { .. }));
        assert_eq!(system.metrics().snapshot().restart_failures, 1);
    }

    #[tokio::test]
    async fn test_stop_directive_reports_failure() {
        let system = ActorSystem::new("test");
        let probe = TestProbe::<(u32, u32)>::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Stop, &probe));

        actor.tell(CounterMsg::Fail);
        let status = actor.terminated().await;
        assert_eq!(
            status,
            ActorStatus::Failed {
                reason: "boom: requested".to_string()
            }
        );
        assert!(actor.is_terminated());
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let system = ActorSystem::new("test");
        let probe = TestProbe::<(u32, u32)>::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Resume, &probe));

        actor.tell(CounterMsg::Stop);
        assert_eq!(actor.terminated().await, ActorStatus::Stopped);
        assert_eq!(system.active_actors(), 0);
    }

    #[tokio::test]
    async fn test_single_timer_fires_once() {
        let system = ActorSystem::new("test");
        let mut probe = TestProbe::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Resume, &probe));

        actor.tell(CounterMsg::Later(7, Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        actor.tell(CounterMsg::Report);

        assert_eq!(probe.expect_message().await, (7, 1));
    }

    #[tokio::test]
    async fn test_cancelled_timer_does_not_deliver() {
        let system = ActorSystem::new("test");
        let mut probe = TestProbe::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Resume, &probe));

        actor.tell(CounterMsg::Later(7, Duration::from_millis(30)));
        actor.tell(CounterMsg::CancelLater);
        tokio::time::sleep(Duration::from_millis(100)).await;
        actor.tell(CounterMsg::Report);

        assert_eq!(probe.expect_message().await, (0, 1));
    }

    #[tokio::test]
    async fn test_replaced_timer_uses_latest_message() {
        let system = ActorSystem::new("test");
        let mut probe = TestProbe::new();
        let actor = system.spawn("counter", counter(SupervisorDirective::Resume, &probe));

        actor.tell(CounterMsg::Later(1, Duration::from_millis(10)));
        actor.tell(CounterMsg::Later(10, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        actor.tell(CounterMsg::Report);

        assert_eq!(probe.expect_message().await, (10, 1));
    }

    struct Piper {
        report_to: Recipient<u64>,
    }

    #[async_trait]
    impl ActorBehavior for Piper {
        type Message = u64;
        type Error = Boom;

        async fn handle(&mut self, ctx: &mut ActorContext<u64>, msg: u64) -> Result<(), Boom> {
            if msg < 100 {
                ctx.pipe_to_self(
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        msg * 1000
                    },
                    |n| n,
                );
            } else {
                self.report_to.tell(msg);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipe_to_self() {
        let system = ActorSystem::new("test");
        let mut probe = TestProbe::new();
        let actor = system.spawn("piper", Piper { report_to: probe.recipient() });

        actor.tell(3);
        assert_eq!(probe.expect_message().await, 3000);
    }

    struct Watcher {
        report_to: Recipient<&'static str>,
    }

    #[async_trait]
    impl ActorBehavior for Watcher {
        type Message = Option<ActorRef<CounterMsg>>;
        type Error = Boom;

        async fn handle(
            &mut self,
            ctx: &mut ActorContext<Self::Message>,
            msg: Self::Message,
        ) -> Result<(), Boom> {
            match msg {
                Some(child) => ctx.watch_with(child.terminated(), None),
                None => {
                    self.report_to.tell("terminated");
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_watch_with_notifies_on_termination() {
        let system = ActorSystem::new("test");
        let mut probe = TestProbe::new();
        let counter_probe = TestProbe::<(u32, u32)>::new();
        let child = system.spawn("child", counter(SupervisorDirective::Resume, &counter_probe));
        let watcher = system.spawn("watcher", Watcher { report_to: probe.recipient() });

        watcher.tell(Some(child.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        child.stop();

        assert_eq!(probe.expect_message().await, "terminated");
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_actors() {
        let system = ActorSystem::new("test");
        let probe = TestProbe::<(u32, u32)>::new();
        let a = system.spawn("a", counter(SupervisorDirective::Resume, &probe));
        let b = system.spawn("b", counter(SupervisorDirective::Resume, &probe));

        system.shutdown(Duration::from_secs(1)).await;

        assert_eq!(a.terminated().await, ActorStatus::Stopped);
        assert_eq!(b.terminated().await, ActorStatus::Stopped);
        assert_eq!(system.active_actors(), 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut ctx = SupervisionContext::new(SupervisionStrategy {
            max_restarts: 10,
            restart_window: Duration::from_secs(60),
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        });
        assert!(ctx.should_restart());
        assert_eq!(ctx.backoff(), Duration::from_millis(100));
        assert!(ctx.should_restart());
        assert_eq!(ctx.backoff(), Duration::from_millis(200));
        assert!(ctx.should_restart());
        assert_eq!(ctx.backoff(), Duration::from_millis(350));
    }
}
