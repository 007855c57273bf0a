//! Strand: a cooperative multi-service scheduler
//!
//! Many independent services, each a coroutine hosted by an [`Engine`],
//! exchange messages through bounded mailboxes and are multiplexed over a
//! fixed pool of worker threads:
//! - **Services**: slot table, status machine, mailbox, outbox, receipt (`service`)
//! - **Scheduler**: owner token, dispatch pass, workers, exclusive threads, timer (`scheduler`)
//! - **Context**: the API a running service calls (`context`)
//! - **Runtime**: bootstrap, thread lifecycle, external input (`runtime`)
//!
//! # Example
//!
//! ```rust,ignore
//! use strand::{NativeEngine, Runtime, RuntimeConfig, ServiceContext, ServiceId, Step};
//! use std::sync::Arc;
//!
//! let engine = NativeEngine::new()
//!     .with_program("root", || |_: &mut ServiceContext<'_>| Step::Exit);
//! let rt = Runtime::new(RuntimeConfig::with_workers(2), Arc::new(engine))?;
//! rt.new_service("root", "root", Some(ServiceId::ROOT), None)?;
//! rt.run()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Sizing constants
pub mod defaults;

/// Error types
pub mod error;

/// Runtime configuration
pub mod config;

/// Message envelopes and ids
pub mod message;

/// Bounded SPSC ring queue
pub mod queue;

/// Payload serialization helpers
pub mod codec;

/// Execution engine boundary
pub mod engine;

/// Thread wake events
pub mod event;

/// Service logs and crash reports
pub mod diagnostics;

/// Service registry
pub mod service;

/// Scheduler core
pub mod scheduler;

/// Service-side API
pub mod context;

/// Runtime bootstrap
pub mod runtime;

pub use config::RuntimeConfig;
pub use context::ServiceContext;
pub use diagnostics::{DiagnosticSink, LogQueue, LogRecord};
pub use engine::{
    Engine, EngineError, ExecutionContext, MemoryStats, NativeEngine, Program, Resume, Step,
};
pub use error::{Result, RuntimeError};
pub use event::{CondvarEvent, WakeEvent};
pub use message::{Inbound, Message, MessageType, Payload, Receipt, ServiceId, Session};
pub use queue::RingQueue;
pub use runtime::{ExternalSender, PreinitHandle, Runtime};
pub use scheduler::timer::{Timer, TimerEvent, TimingWheel};
pub use scheduler::ThreadRole;
pub use service::{HangOutcome, PushError, SendError, ServicePool, ServiceStatus};
