//! Actor runtime errors

use crate::actor_ref::ActorId;
use thiserror::Error;

/// Errors surfaced by the actor runtime itself.
///
/// Behavior-level failures use the behavior's own error type and are routed
/// through [`crate::ActorBehavior::on_error`]; these variants only cover the
/// plumbing around them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActorError {
    #[error("Mailbox of actor {actor} ({name}) is closed")]
    MailboxClosed { actor: ActorId, name: String },

    #[error("Actor {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

impl ActorError {
    pub fn mailbox_closed(actor: &ActorId, name: &str) -> Self {
        Self::MailboxClosed {
            actor: actor.clone(),
            name: name.to_string(),
        }
    }

    /// Error category used in structured log fields
    pub fn category(&self) -> &'static str {
        match self {
            ActorError::MailboxClosed { .. } => "mailbox",
            ActorError::StartupFailed { .. } => "startup",
        }
    }
}

pub type Result<T> = std::result::Result<T, ActorError>;
