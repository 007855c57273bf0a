//! Runtime error types.

use crate::engine::EngineError;
use crate::message::ServiceId;
use crate::service::ServiceStatus;

/// Errors surfaced by runtime bootstrap and by the service-side API.
///
/// Mailbox and queue backpressure are not errors: they come back as values
/// that hand ownership of the message to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// File I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// TOML decoding error
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Execution engine failure (create/load)
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Payload (de)serialization failure
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// No free slot left in the service table
    #[error("Service table is full")]
    ServiceTableFull,

    /// The requested id already has a live slot
    #[error("Service id {0} is occupied")]
    IdOccupied(ServiceId),

    /// The id does not name a live service
    #[error("Service {0} does not exist")]
    NoService(ServiceId),

    /// The service is in the wrong state for the operation
    #[error("Service {id} is {status:?}")]
    InvalidStatus {
        /// Target service
        id: ServiceId,
        /// Status observed
        status: ServiceStatus,
    },

    /// Operation reserved to the root service
    #[error("Service {0} is not root")]
    NotRoot(ServiceId),

    /// Operation reserved to exclusive services
    #[error("Service {0} is not in an exclusive thread")]
    NotExclusive(ServiceId),

    /// Worker index out of range
    #[error("Invalid worker id {0}")]
    InvalidWorker(usize),

    /// All exclusive thread records are taken
    #[error("Too many exclusive threads")]
    TooManyExclusive,

    /// A previous outbound message has not been routed yet
    #[error("Service {0} already has a pending outbound message")]
    OutboxOccupied(ServiceId),

    /// close/delete requested before the service was hung
    #[error("Hang service {0} before closing it")]
    NotDead(ServiceId),

    /// Timer delay does not fit the wheel
    #[error("Invalid timer {0}")]
    TimerRange(u64),

    /// OS refused to start a runtime thread
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Runtime result
pub type Result<T> = std::result::Result<T, RuntimeError>;
