//! The API a running service sees
//!
//! A [`ServiceContext`] is created by the thread that resumes a service and
//! handed to the engine for the duration of one quantum.

use crate::diagnostics::LogRecord;
use crate::engine::MemoryStats;
use crate::error::{Result, RuntimeError};
use crate::event::WakeEvent;
use crate::message::{Inbound, Message, MessageType, Payload, Receipt, ServiceId, Session};
use crate::scheduler::{ContextSource, Shared, ThreadRole};
use crate::service::{HangOutcome, PushError, SendError, ServiceStatus};
use std::time::Duration;
use tracing::debug;

/// Handle passed to a service body on every resume
pub struct ServiceContext<'a> {
    shared: &'a Shared,
    id: ServiceId,
    role: ThreadRole,
}

impl std::fmt::Debug for ServiceContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish()
    }
}

impl<'a> ServiceContext<'a> {
    pub(crate) fn new(shared: &'a Shared, id: ServiceId, role: ThreadRole) -> Self {
        Self { shared, id, role }
    }

    /// This service's id
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Label given at creation
    pub fn label(&self) -> String {
        self.shared.pool.label(self.id).unwrap_or_default()
    }

    /// Thread running this quantum
    pub fn role(&self) -> ThreadRole {
        self.role
    }

    /// Index of the worker running this quantum (None in exclusive threads)
    pub fn worker_id(&self) -> Option<usize> {
        match self.role {
            ThreadRole::Worker(n) => Some(n),
            _ => None,
        }
    }

    /// Number of workers in the runtime
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    fn message(
        &self,
        to: ServiceId,
        session: Session,
        kind: MessageType,
        payload: Option<Payload>,
    ) -> Message {
        Message {
            from: self.id,
            to,
            session,
            kind,
            payload,
        }
    }

    /// Place a message in the outbox. It is routed after this quantum and
    /// its outcome arrives as a receipt.
    pub fn send(
        &self,
        to: ServiceId,
        session: Session,
        kind: MessageType,
        payload: Option<Payload>,
    ) -> std::result::Result<(), SendError> {
        self.shared
            .pool
            .send_out(self.message(to, session, kind, payload))
    }

    /// Push straight into the target mailbox and report the outcome now.
    /// Blocks briefly for scheduler ownership.
    pub fn send_direct(
        &self,
        to: ServiceId,
        session: Session,
        kind: MessageType,
        payload: Option<Payload>,
    ) -> Receipt {
        let msg = self.message(to, session, kind, payload);
        if to.is_system() {
            return Receipt::Error(Some(msg));
        }
        let mut owner = self.shared.owner.acquire(self.role);
        match self.shared.pool.push_message(msg) {
            Ok(()) => {
                self.shared.check_message_to(&mut owner, to);
                Receipt::Done
            }
            Err(PushError::Blocked(msg)) => Receipt::Block(msg),
            Err(PushError::Dead(msg)) => Receipt::Error(Some(msg)),
        }
    }

    /// Next receipt or mailbox message
    pub fn recv(&self) -> Option<Inbound> {
        self.shared.pool.pop_message(self.id)
    }

    /// Take the pending receipt only
    pub fn receipt(&self) -> Option<Receipt> {
        self.shared.pool.read_receipt(self.id)
    }

    /// Items waiting in the receipt slot and mailbox
    pub fn pending(&self) -> usize {
        self.shared.pool.message_count(self.id)
    }

    /// Ask for a `Response` with `session` after `ticks` timer ticks
    pub fn timer_add(&self, session: Session, ticks: u64) -> Result<()> {
        let ticks = u32::try_from(ticks)
            .ok()
            .filter(|t| *t <= i32::MAX as u32)
            .ok_or(RuntimeError::TimerRange(ticks))?;
        self.shared.timer.add(self.id, session, ticks);
        Ok(())
    }

    /// (wall-clock start second, ticks since start)
    pub fn now(&self) -> (u64, u64) {
        (self.shared.timer.start_time(), self.shared.timer.now())
    }

    /// Timer resolution
    pub fn tick(&self) -> Duration {
        self.shared.timer.resolution()
    }

    /// Pin this service to a worker, or unpin with `None`
    pub fn bind(&self, worker: Option<usize>) -> Result<()> {
        if let Some(w) = worker {
            if w >= self.shared.workers.len() {
                return Err(RuntimeError::InvalidWorker(w));
            }
        }
        self.shared.pool.set_binding(self.id, worker)
    }

    /// Worker this service is pinned to
    pub fn binding(&self) -> Option<usize> {
        self.shared.pool.binding(self.id)
    }

    /// Accumulated CPU time inside resumes (excluding the current one)
    pub fn cpu_cost(&self) -> Duration {
        self.shared.pool.cpu_cost(self.id)
    }

    /// Current memory limit in bytes (0 = unlimited)
    pub fn memory_limit(&self) -> usize {
        self.shared.pool.mem_limit(self.id)
    }

    /// Set the memory limit, returning the old one
    pub fn mem_limit(&self, limit: usize) -> usize {
        self.shared.pool.set_mem_limit(self.id, limit)
    }

    /// Memory accounting as of the previous quantum
    pub fn mem_stats(&self) -> MemoryStats {
        self.shared.pool.memory_stats(self.id)
    }

    /// Append a line to the runtime log queue
    pub fn push_log(&self, data: impl Into<Box<[u8]>>) {
        self.shared.diagnostics.push(self.id, data);
    }

    /// Take the oldest log record
    pub fn pop_log(&self) -> Option<LogRecord> {
        self.shared.diagnostics.pop()
    }

    /// Whether `id` runs in an exclusive thread
    pub fn is_exclusive(&self, id: ServiceId) -> bool {
        self.shared.pool.status(id) == ServiceStatus::Exclusive
    }

    /// Wake the exclusive thread that owns `id`
    pub fn touch(&self, id: ServiceId) -> Result<()> {
        let thread = self
            .shared
            .pool
            .exclusive_thread(id)
            .and_then(|t| self.shared.exclusive(t))
            .ok_or(RuntimeError::NotExclusive(id))?;
        thread.event.trigger();
        Ok(())
    }

    fn exclusive_index(&self) -> Option<usize> {
        match self.role {
            ThreadRole::Exclusive(n) => Some(n),
            _ => None,
        }
    }

    /// Queue a message on this exclusive thread's sending queue
    pub fn exclusive_send(
        &self,
        to: ServiceId,
        session: Session,
        kind: MessageType,
        payload: Option<Payload>,
    ) -> std::result::Result<(), SendError> {
        let msg = self.message(to, session, kind, payload);
        match self.exclusive_index().and_then(|n| self.shared.exclusive(n)) {
            Some(thread) => thread.enqueue(msg),
            None => Err(SendError::NotExclusive(msg)),
        }
    }

    /// Park until someone sends to or touches this service. Returns false
    /// once the runtime is shutting down.
    pub fn event_wait(&self) -> Result<bool> {
        let thread = self
            .exclusive_index()
            .and_then(|n| self.shared.exclusive(n))
            .ok_or(RuntimeError::NotExclusive(self.id))?;
        if self.shared.pool.has_message(self.id) {
            return Ok(true);
        }
        Ok(thread.event.wait())
    }

    /// Flush the outbox and sending queue without waiting for the quantum
    /// to end
    pub fn scheduling(&self) -> Result<()> {
        let index = self
            .exclusive_index()
            .ok_or(RuntimeError::NotExclusive(self.id))?;
        self.shared.exclusive_message(index);
        Ok(())
    }

    fn require_root(&self) -> Result<()> {
        if self.id.is_root() {
            Ok(())
        } else {
            Err(RuntimeError::NotRoot(self.id))
        }
    }

    /// Root only: give a slot obtained through `ScheduleNew` its program
    pub fn init_service(
        &self,
        id: ServiceId,
        label: &str,
        source: &str,
        binding: Option<usize>,
    ) -> Result<()> {
        self.require_root()?;
        self.shared
            .init_service(id, label, ContextSource::Load(source), binding)
    }

    /// Root only: allocate and initialize a service in one step
    pub fn spawn(&self, label: &str, source: &str, binding: Option<usize>) -> Result<ServiceId> {
        self.require_root()?;
        let id = self.shared.pool.new_service(None)?;
        self.shared
            .init_service(id, label, ContextSource::Load(source), binding)?;
        debug!(service = %id, label, "spawned");
        Ok(id)
    }

    /// Root only: drain and delete a hung service, returning the
    /// `(from, session)` pairs still waiting for an answer
    pub fn close_service(&self, id: ServiceId) -> Result<Vec<(ServiceId, Session)>> {
        self.require_root()?;
        self.shared.pool.close(id)
    }

    /// Root only: stop a service unless it is mid-quantum
    pub fn hang(&self, id: ServiceId) -> Result<HangOutcome> {
        self.require_root()?;
        self.shared.pool.hang(id)
    }

    /// Status of any service
    pub fn status(&self, id: ServiceId) -> ServiceStatus {
        self.shared.pool.status(id)
    }
}
