//! Default constants for runtime configuration.
//!
//! Centralizes the sizing numbers shared by config.rs, the service pool and
//! the scheduler.

/// Hard upper bound on worker threads.
pub const MAX_WORKER: usize = 256;

/// Maximum number of exclusive threads per runtime.
pub const MAX_EXCLUSIVE: usize = 16;

/// Default mailbox ring size (slots, power of two).
pub const DEFAULT_QUEUE: usize = 4096;

/// Default size of an exclusive thread's sending queue.
pub const DEFAULT_QUEUE_SENDING: usize = DEFAULT_QUEUE;

/// Default size of the service slot table (power of two).
pub const DEFAULT_MAX_SERVICE: usize = 65536;

/// Slots in each worker's private binding queue.
pub const BINDING_QUEUE: usize = 16;

/// Distinct blocked targets tracked during one sending-queue flush.
pub const SENDING_BLOCKED: usize = 128;

/// Default timer resolution in milliseconds (one wheel tick).
pub const DEFAULT_TICK_MS: u64 = 10;

/// Bytes of backtrace kept in a crash report.
pub const BACKTRACE_LIMIT: usize = 4096;
