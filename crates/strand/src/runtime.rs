//! Runtime bootstrap and thread management
//!
//! Build a [`Runtime`], create the root service (id 1) and any other
//! services, then call [`Runtime::run`]. `run` returns once the root
//! service has terminated and every runtime thread has exited.

use crate::config::RuntimeConfig;
use crate::defaults::MAX_EXCLUSIVE;
use crate::diagnostics::{DiagnosticSink, Diagnostics, LogQueue, LogRecord};
use crate::engine::{Engine, EngineError, ExecutionContext};
use crate::error::{Result, RuntimeError};
use crate::message::{Message, MessageType, Payload, ServiceId, Session};
use crate::scheduler::exclusive::ExclusiveThread;
use crate::scheduler::timer::Timer;
use crate::scheduler::{ContextSource, Shared, ThreadRole};
use crate::service::{PushError, ServicePool, ServiceStatus};
use crossbeam::channel::{self, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A scheduler instance with its worker pool
pub struct Runtime {
    shared: Arc<Shared>,
    external: Option<Sender<Message>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.shared.workers.len())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

impl Runtime {
    /// Create a runtime whose service logs go to an in-memory [`LogQueue`]
    pub fn new(config: RuntimeConfig, engine: Arc<dyn Engine>) -> Result<Self> {
        Self::with_sink(config, engine, Arc::new(LogQueue::new()))
    }

    /// Create a runtime with a custom diagnostics sink
    pub fn with_sink(
        config: RuntimeConfig,
        engine: Arc<dyn Engine>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let config = config.normalized()?;
        let timer = Arc::new(Timer::new(Duration::from_millis(config.tick_ms)));
        let diagnostics = Arc::new(Diagnostics::new(sink, timer.clone(), config.crashlog.clone()));
        let (external, receiver) = if config.external_queue > 0 {
            let (tx, rx) = channel::bounded(config.external_queue);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        info!(
            workers = config.worker,
            max_service = config.max_service,
            queue = config.queue,
            "runtime created"
        );
        let shared = Arc::new(Shared::new(config, engine, timer, diagnostics, receiver));
        Ok(Self {
            shared,
            external,
            started: AtomicBool::new(false),
        })
    }

    /// Effective (normalized) configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The service table, for inspection
    pub fn pool(&self) -> &ServicePool {
        &self.shared.pool
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Status of a service
    pub fn status(&self, id: ServiceId) -> ServiceStatus {
        self.shared.pool.status(id)
    }

    /// Create and initialize a service from engine source.
    ///
    /// Pass `Some(ServiceId::ROOT)` to create the root service.
    pub fn new_service(
        &self,
        label: &str,
        source: &str,
        id: Option<ServiceId>,
        binding: Option<usize>,
    ) -> Result<ServiceId> {
        let id = self.shared.pool.new_service(id)?;
        self.shared
            .init_service(id, label, ContextSource::Load(source), binding)?;
        debug!(service = %id, label, "service created");
        Ok(id)
    }

    /// Start building an execution context on a background thread
    pub fn preinit(&self, source: &str) -> Result<PreinitHandle> {
        let engine = self.shared.engine.clone();
        let owned = source.to_string();
        let thread = thread::Builder::new()
            .name("strand-preinit".to_string())
            .spawn(move || {
                let mut context = engine.create()?;
                context.load(&owned)?;
                Ok(context)
            })
            .map_err(RuntimeError::ThreadSpawn)?;
        Ok(PreinitHandle {
            source: source.to_string(),
            thread,
        })
    }

    /// Create a service from a preinitialized context, moving it in
    pub fn new_service_preinit(
        &self,
        label: &str,
        id: Option<ServiceId>,
        handle: PreinitHandle,
        binding: Option<usize>,
    ) -> Result<ServiceId> {
        let context = handle.take()?;
        let id = self.shared.pool.new_service(id)?;
        self.shared
            .init_service(id, label, ContextSource::Ready(context), binding)?;
        debug!(service = %id, label, "service created from preinit");
        Ok(id)
    }

    /// Move an idle service onto its own thread. Returns the thread index.
    pub fn new_exclusive(&self, id: ServiceId) -> Result<usize> {
        if self.started.load(Ordering::Acquire) {
            return Err(RuntimeError::Config(
                "exclusive threads must be created before run".into(),
            ));
        }
        let mut exclusives = self.shared.exclusives.write();
        let index = exclusives.len();
        if index >= MAX_EXCLUSIVE {
            return Err(RuntimeError::TooManyExclusive);
        }
        self.shared.pool.set_exclusive(id, index)?;
        exclusives.push(Arc::new(ExclusiveThread::new(
            index,
            id,
            self.shared.config.queue_sending,
        )));
        debug!(service = %id, thread = index, "exclusive service");
        Ok(index)
    }

    /// Deliver a message into a mailbox now, scheduling the target
    pub fn post_message(&self, msg: Message) -> std::result::Result<(), PushError> {
        let mut owner = self.shared.owner.acquire(ThreadRole::External);
        let to = msg.to;
        self.shared.pool.push_message(msg)?;
        self.shared.check_message_to(&mut owner, to);
        // Assign it now: a worker that failed to take ownership from us may
        // already be on its way to sleep.
        self.shared.schedule_dispatch(&mut owner);
        Ok(())
    }

    /// Handle for feeding messages to root from outside the runtime
    pub fn external_sender(&self) -> Option<ExternalSender> {
        self.external.as_ref().map(|tx| ExternalSender {
            tx: tx.clone(),
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Oldest record in the log queue
    pub fn pop_log(&self) -> Option<LogRecord> {
        self.shared.diagnostics.pop()
    }

    /// Whether worker `index` has been told to quit
    pub fn worker_term_signal(&self, index: usize) -> Option<bool> {
        self.shared
            .workers
            .get(index)
            .map(|w| w.term.load(Ordering::Acquire))
    }

    /// Whether exclusive thread `index` has been told to quit
    pub fn exclusive_term_signal(&self, index: usize) -> Option<bool> {
        self.shared
            .exclusive(index)
            .map(|e| e.term.load(Ordering::Acquire))
    }

    /// Jobs each worker has run so far
    pub fn worker_jobs(&self) -> Vec<u64> {
        self.shared
            .workers
            .iter()
            .map(|w| w.jobs.load(Ordering::Relaxed))
            .collect()
    }

    /// Ask every thread to stop; `run` returns soon after
    pub fn shutdown(&self) {
        self.shared.shutdown_all("shutdown requested");
    }

    /// Run until the root service terminates
    pub fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::Config("runtime already started".into()));
        }
        let root = ServiceId::ROOT;
        match self.shared.pool.status(root) {
            ServiceStatus::Idle | ServiceStatus::Schedule | ServiceStatus::Exclusive => {}
            ServiceStatus::Dead => return Err(RuntimeError::NoService(root)),
            status => return Err(RuntimeError::InvalidStatus { id: root, status }),
        }
        {
            let mut owner = self.shared.owner.acquire(ThreadRole::External);
            if self.shared.pool.transition(root, ServiceStatus::Idle, ServiceStatus::Schedule) {
                self.shared.schedule_back(&mut owner, root);
            }
        }

        let started = Instant::now();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        if let Err(e) = self.spawn_threads(&mut handles) {
            warn!("thread start failed: {}", e);
            self.shared.shutdown_all("thread start failed");
            join_all(handles);
            return Err(e);
        }

        let ticker = {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("strand-timer".to_string())
                .spawn(move || timer_main(&shared))
                .map_err(RuntimeError::ThreadSpawn)
        };
        let ticker = match ticker {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.shutdown_all("thread start failed");
                join_all(handles);
                return Err(e);
            }
        };

        join_all(handles);
        self.shared.shutdown_all("all threads quit");
        if ticker.join().is_err() {
            warn!("timer thread panicked");
        }
        info!(elapsed = ?started.elapsed(), "runtime stopped");
        Ok(())
    }

    fn spawn_threads(&self, handles: &mut Vec<JoinHandle<()>>) -> Result<()> {
        let exclusives = self.shared.exclusives.read().clone();
        for thread in exclusives {
            let shared = self.shared.clone();
            let label = self.shared.pool.label(thread.service).unwrap_or_default();
            let index = thread.index;
            self.shared.thread_count.fetch_add(1, Ordering::AcqRel);
            let handle = thread::Builder::new()
                .name(format!("strand-{}", label))
                .spawn(move || shared.exclusive_main(index))
                .map_err(|e| {
                    self.shared.thread_count.fetch_sub(1, Ordering::AcqRel);
                    RuntimeError::ThreadSpawn(e)
                })?;
            handles.push(handle);
        }
        for index in 0..self.shared.workers.len() {
            let shared = self.shared.clone();
            self.shared.thread_count.fetch_add(1, Ordering::AcqRel);
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{:02}", index))
                .spawn(move || shared.worker_main(index))
                .map_err(|e| {
                    self.shared.thread_count.fetch_sub(1, Ordering::AcqRel);
                    RuntimeError::ThreadSpawn(e)
                })?;
            handles.push(handle);
        }
        Ok(())
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            warn!("runtime thread panicked");
        }
    }
}

/// Ticker: run a pass each tick while timers or external input are pending
fn timer_main(shared: &Shared) {
    debug!("timer thread started");
    while shared.timer.sleep_tick() {
        let external = shared.external.as_ref().is_some_and(|rx| !rx.is_empty());
        if shared.timer.pending() == 0 && !external {
            continue;
        }
        if let Some(mut owner) = shared.owner.try_acquire(ThreadRole::Timer) {
            shared.schedule_dispatch(&mut owner);
        }
    }
    debug!("timer thread quit");
}

/// A context being created on the preinit thread
#[derive(Debug)]
pub struct PreinitHandle {
    source: String,
    thread: JoinHandle<std::result::Result<Box<dyn ExecutionContext>, EngineError>>,
}

impl PreinitHandle {
    /// Source being loaded
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wait for the context; the handle is consumed
    fn take(self) -> Result<Box<dyn ExecutionContext>> {
        match self.thread.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Panic(format!("preinit of '{}' panicked", self.source)).into()),
        }
    }
}

/// Sends messages to the root service from outside the runtime
#[derive(Clone)]
pub struct ExternalSender {
    tx: Sender<Message>,
    shared: Weak<Shared>,
}

impl std::fmt::Debug for ExternalSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSender")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl ExternalSender {
    /// Queue a message for root; gives it back if the channel is full or
    /// the runtime is gone
    pub fn send(
        &self,
        session: Session,
        kind: MessageType,
        payload: Option<Payload>,
    ) -> std::result::Result<(), Message> {
        let msg = Message {
            from: ServiceId::SYSTEM,
            to: ServiceId::ROOT,
            session,
            kind,
            payload,
        };
        match self.tx.try_send(msg) {
            Ok(()) => {
                if let Some(shared) = self.shared.upgrade() {
                    shared.kick();
                }
                Ok(())
            }
            Err(TrySendError::Full(msg)) | Err(TrySendError::Disconnected(msg)) => Err(msg),
        }
    }
}
