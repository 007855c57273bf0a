//! Scheduler core
//!
//! - `owner` - the single-owner CAS token guarding dispatch state
//! - `dispatch` - `schedule_dispatch` and message routing
//! - `worker` - worker job slots and the worker run loop
//! - `exclusive` - dedicated threads for blocking services
//! - `timer` - hierarchical timing wheel
//!
//! There is no scheduler thread. Whichever worker (or exclusive thread)
//! wins the owner token runs one dispatch pass inline and releases it.

pub(crate) mod dispatch;
pub(crate) mod exclusive;
pub(crate) mod owner;
pub mod timer;
pub(crate) mod worker;

pub use owner::ThreadRole;

use crate::config::RuntimeConfig;
use crate::diagnostics::Diagnostics;
use crate::engine::{Engine, ExecutionContext};
use crate::error::{Result, RuntimeError};
use crate::event::WakeEvent;
use crate::message::{Message, ServiceId};
use crate::service::ServicePool;
use crossbeam::channel::Receiver;
use dispatch::DispatchState;
use exclusive::ExclusiveThread;
use owner::OwnerToken;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use timer::Timer;
use tracing::{debug, info};
use worker::WorkerSlot;

/// Where a service's execution context comes from
pub(crate) enum ContextSource<'a> {
    /// Create a fresh context and load this source into it
    Load(&'a str),
    /// A context prepared elsewhere, moved in as-is
    Ready(Box<dyn ExecutionContext>),
}

/// Everything the runtime threads share
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) pool: ServicePool,
    pub(crate) workers: Box<[WorkerSlot]>,
    pub(crate) exclusives: RwLock<Vec<Arc<ExclusiveThread>>>,
    pub(crate) owner: OwnerToken,
    pub(crate) timer: Arc<Timer>,
    pub(crate) diagnostics: Arc<Diagnostics>,
    pub(crate) active_workers: AtomicUsize,
    pub(crate) thread_count: AtomicUsize,
    pub(crate) external: Option<Receiver<Message>>,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        config: RuntimeConfig,
        engine: Arc<dyn Engine>,
        timer: Arc<Timer>,
        diagnostics: Arc<Diagnostics>,
        external: Option<Receiver<Message>>,
    ) -> Self {
        let pool = ServicePool::new(config.max_service, config.queue, diagnostics.clone());
        let workers = (0..config.worker)
            .map(WorkerSlot::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let state = DispatchState::new(config.max_service, config.worker);
        Self {
            pool,
            workers,
            exclusives: RwLock::new(Vec::new()),
            owner: OwnerToken::new(state),
            timer,
            diagnostics,
            active_workers: AtomicUsize::new(0),
            thread_count: AtomicUsize::new(0),
            external,
            shutdown: AtomicBool::new(false),
            engine,
            config,
        }
    }

    pub(crate) fn exclusive(&self, index: usize) -> Option<Arc<ExclusiveThread>> {
        self.exclusives.read().get(index).cloned()
    }

    /// Initialize an allocated slot: context, label, binding.
    /// On failure the slot is released again.
    pub(crate) fn init_service(
        &self,
        id: ServiceId,
        label: &str,
        source: ContextSource<'_>,
        binding: Option<usize>,
    ) -> Result<()> {
        let result = self.try_init_service(id, label, source, binding);
        if let Err(e) = &result {
            debug!(service = %id, label, "init failed: {}", e);
            let _ = self.pool.delete(id);
        }
        result
    }

    fn try_init_service(
        &self,
        id: ServiceId,
        label: &str,
        source: ContextSource<'_>,
        binding: Option<usize>,
    ) -> Result<()> {
        if let Some(w) = binding {
            if w >= self.workers.len() {
                return Err(RuntimeError::InvalidWorker(w));
            }
        }
        let context = match source {
            ContextSource::Load(source) => {
                let mut context = self.engine.create()?;
                context.load(source)?;
                context
            }
            ContextSource::Ready(context) => context,
        };
        self.pool.init(id, context, label)?;
        self.pool.set_binding(id, binding)
    }

    /// Raise every term signal and wake every parked thread
    pub(crate) fn shutdown_all(&self, reason: &str) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("runtime shutting down: {}", reason);
        for w in self.workers.iter() {
            w.term.store(true, Ordering::Release);
        }
        for e in self.exclusives.read().iter() {
            e.term.store(true, Ordering::Release);
            e.event.close();
        }
        for w in self.workers.iter() {
            w.event.trigger();
        }
        self.timer.stop();
    }

    /// Wake one unbound worker so it runs a pass. Prefers a parked one;
    /// otherwise the trigger is left pending on the first unbound worker
    /// and consumed by its next wait.
    pub(crate) fn kick(&self) {
        let mut fallback = None;
        for w in self.workers.iter().filter(|w| w.bound().is_none()) {
            if w.event.is_waiting() {
                if w.event.trigger() {
                    return;
                }
            } else if fallback.is_none() {
                fallback = Some(w);
            }
        }
        if let Some(w) = fallback {
            w.event.trigger();
        }
    }
}
