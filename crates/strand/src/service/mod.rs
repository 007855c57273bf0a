//! Service registry
//!
//! A fixed slot table of service records, indexed by `id & mask`. A record is
//! only returned when its stored id matches, so a stale id never reaches a
//! recycled slot.

mod pool;
mod record;

pub use pool::{HangOutcome, ServicePool};
pub use record::ServiceStatus;

use crate::message::Message;

/// Why a message could not be placed in a mailbox. Ownership comes back.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Target mailbox is full
    #[error("mailbox of {} is full", .0.to)]
    Blocked(Message),

    /// Target slot is gone or the service is dead
    #[error("service {} is dead", .0.to)]
    Dead(Message),
}

impl PushError {
    /// Recover the undelivered message
    pub fn into_message(self) -> Message {
        match self {
            PushError::Blocked(m) | PushError::Dead(m) => m,
        }
    }
}

/// Why an outbound message was not accepted. Ownership comes back.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The single outbox slot still holds an unrouted message
    #[error("outbox of {} already holds a message", .0.from)]
    OutboxOccupied(Message),

    /// The sending service no longer exists
    #[error("service {} does not exist", .0.from)]
    NoService(Message),

    /// The exclusive sending queue is full
    #[error("sending queue of {} is full", .0.from)]
    QueueFull(Message),

    /// Sender is not running in an exclusive thread
    #[error("service {} is not in an exclusive thread", .0.from)]
    NotExclusive(Message),
}

impl SendError {
    /// Recover the unsent message
    pub fn into_message(self) -> Message {
        match self {
            SendError::OutboxOccupied(m)
            | SendError::NoService(m)
            | SendError::QueueFull(m)
            | SendError::NotExclusive(m) => m,
        }
    }
}
