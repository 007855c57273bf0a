//! Execution engine boundary
//!
//! The scheduler treats a service body as an opaque coroutine: create it,
//! load code into it, resume it until it yields or terminates. Anything that
//! implements [`Engine`] can host services.

pub mod native;

use crate::context::ServiceContext;
use std::collections::BTreeMap;

pub use native::{NativeEngine, Program, Step};

/// Errors raised by an engine or by code running inside it
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The engine could not allocate a context
    #[error("cannot create context: {0}")]
    Create(String),

    /// Source failed to load
    #[error("cannot load '{source_name}': {reason}")]
    Load {
        /// What was being loaded
        source_name: String,
        /// Why it failed
        reason: String,
    },

    /// Resume called before a successful load
    #[error("context has no program loaded")]
    NotLoaded,

    /// The service body reported an error
    #[error("{0}")]
    Fault(String),

    /// The service body panicked
    #[error("panic: {0}")]
    Panic(String),

    /// Allocation refused by the memory limit
    #[error("memory limit of {limit} bytes exceeded")]
    MemoryLimit {
        /// Limit in force
        limit: usize,
    },
}

/// Outcome of one resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Suspended; resume again when it has work
    Yielded,
    /// Finished; the service is dead from now on
    Terminated,
}

/// Memory accounting reported by a context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently in use
    pub used: usize,
    /// Peak of `used`
    pub high_water: usize,
    /// Limit in force (0 = unlimited)
    pub limit: usize,
    /// Live object counts per type name
    pub objects: BTreeMap<String, usize>,
}

/// A coroutine host
pub trait Engine: Send + Sync {
    /// Allocate a fresh, empty context
    fn create(&self) -> Result<Box<dyn ExecutionContext>, EngineError>;
}

/// One service body
pub trait ExecutionContext: Send {
    /// Load source (engine-defined meaning) into the context
    fn load(&mut self, source: &str) -> Result<(), EngineError>;

    /// Run until the body yields or terminates.
    ///
    /// An `Err` means the body faulted; the service is treated as terminated.
    fn resume(&mut self, cx: &mut ServiceContext<'_>) -> Result<Resume, EngineError>;

    /// Human-readable trace of where the body is, for crash reports
    fn backtrace(&self) -> String;

    /// Current memory accounting
    fn memory_stats(&self) -> MemoryStats {
        MemoryStats::default()
    }
}
