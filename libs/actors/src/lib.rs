//! Actor runtime for the reliable delivery controllers
//!
//! Every controller is an actor: a tokio task that owns its state and
//! processes its mailbox one message at a time. The runtime provides exactly
//! what the delivery protocol needs from its messaging substrate:
//!
//! - `tell`: fire-and-forget send through [`ActorRef`] or a type-erased
//!   [`Recipient`] (message adapters via [`ActorRef::adapt`])
//! - `watch`: termination observable via [`ActorRef::terminated`]
//! - keyed timers re-injecting messages ([`TimerScheduler`])
//! - pipe-to-self for async work ([`ActorContext::pipe_to_self`])
//! - restart supervision with bounded exponential backoff
//!
//! ```text
//!   tell ──► mailbox (mpsc) ──► ActorTask ──► ActorBehavior::handle
//!                ▲                  │
//!   timers ──────┘                  └── on_error ─► SupervisorDirective
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use delivery_actors::{ActorBehavior, ActorContext, ActorSystem};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ActorBehavior for Printer {
//!     type Message = String;
//!     type Error = std::io::Error;
//!
//!     async fn handle(&mut self, _ctx: &mut ActorContext<String>, msg: String) -> Result<(), Self::Error> {
//!         println!("Received: {}", msg);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() {
//! let system = ActorSystem::new("example");
//! let printer = system.spawn("printer", Printer);
//! printer.tell("Hello, Actor!".to_string());
//! # }
//! ```

pub mod actor_ref;
pub mod error;
pub mod system;
pub mod testkit;
pub mod timers;

pub use actor_ref::{ActorId, ActorRef, ActorStatus, Recipient};
pub use error::{ActorError, Result};
pub use system::{
    ActorBehavior, ActorContext, ActorSystem, SupervisionStrategy, SupervisorDirective,
    SystemMetrics, SystemStats,
};
pub use timers::TimerScheduler;
