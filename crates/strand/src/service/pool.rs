//! Service slot table

use super::record::{Service, ServiceStatus, UNBOUND};
use super::{PushError, SendError};
use crate::context::ServiceContext;
use crate::diagnostics::Diagnostics;
use crate::engine::{ExecutionContext, MemoryStats, Resume};
use crate::error::{Result, RuntimeError};
use crate::message::{Inbound, Message, MessageType, Receipt, ServiceId, Session};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Result of [`ServicePool::hang`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangOutcome {
    /// The service is now dead
    Hung,
    /// The service is mid-quantum; try again after it yields
    Busy,
}

/// Fixed-size table of service records
pub struct ServicePool {
    mask: usize,
    queue_len: usize,
    /// Allocation cursor for automatic ids
    next_id: Mutex<u32>,
    slots: Box<[RwLock<Option<Arc<Service>>>]>,
    diagnostics: Arc<Diagnostics>,
}

impl std::fmt::Debug for ServicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePool")
            .field("capacity", &self.capacity())
            .field("live", &self.len())
            .finish()
    }
}

impl ServicePool {
    pub(crate) fn new(max_service: usize, queue_len: usize, diagnostics: Arc<Diagnostics>) -> Self {
        debug_assert!(max_service.is_power_of_two());
        let slots = (0..max_service)
            .map(|_| RwLock::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: max_service - 1,
            queue_len,
            next_id: Mutex::new(ServiceId::ROOT.as_u32()),
            slots,
            diagnostics,
        }
    }

    #[inline]
    fn slot(&self, id: u32) -> &RwLock<Option<Arc<Service>>> {
        &self.slots[id as usize & self.mask]
    }

    pub(crate) fn get(&self, id: ServiceId) -> Option<Arc<Service>> {
        let slot = self.slot(id.as_u32()).read();
        match slot.as_ref() {
            Some(s) if s.id == id => Some(s.clone()),
            _ => None,
        }
    }

    fn require(&self, id: ServiceId) -> Result<Arc<Service>> {
        self.get(id).ok_or(RuntimeError::NoService(id))
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.read().is_some()).count()
    }

    /// True when no slot is taken
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a slot, either the requested id or the next free one.
    ///
    /// Automatic allocation never hands out SYSTEM or ROOT.
    pub fn new_service(&self, requested: Option<ServiceId>) -> Result<ServiceId> {
        let mut cursor = self.next_id.lock();
        let id = match requested {
            Some(id) => {
                if id.is_system() {
                    return Err(RuntimeError::IdOccupied(id));
                }
                if self.slot(id.as_u32()).read().is_some() {
                    return Err(RuntimeError::IdOccupied(id));
                }
                id
            }
            None => {
                let mut id = *cursor;
                let mut tries = 0;
                while id <= ServiceId::ROOT.as_u32() || self.slot(id).read().is_some() {
                    id = id.wrapping_add(1);
                    tries += 1;
                    if tries > self.mask + 2 {
                        return Err(RuntimeError::ServiceTableFull);
                    }
                }
                *cursor = id;
                ServiceId::new(id)
            }
        };
        let service = Arc::new(Service::new(id, self.queue_len));
        *self.slot(id.as_u32()).write() = Some(service);
        trace!(service = %id, "slot claimed");
        Ok(id)
    }

    /// Attach an execution context; `Uninitialized` becomes `Idle`.
    pub fn init(&self, id: ServiceId, context: Box<dyn ExecutionContext>, label: &str) -> Result<()> {
        let s = self.require(id)?;
        let status = s.status();
        if status != ServiceStatus::Uninitialized {
            return Err(RuntimeError::InvalidStatus { id, status });
        }
        *s.context.lock() = Some(context);
        let _ = s.label.set(label.to_string());
        s.set_status(ServiceStatus::Idle);
        debug!(service = %id, label, "service initialized");
        Ok(())
    }

    /// Free a slot. Only dead or never-initialized services can go.
    pub fn delete(&self, id: ServiceId) -> Result<()> {
        let s = self.require(id)?;
        match s.status() {
            ServiceStatus::Dead | ServiceStatus::Uninitialized => {}
            _ => return Err(RuntimeError::NotDead(id)),
        }
        let removed = {
            let mut slot = self.slot(id.as_u32()).write();
            match slot.as_ref() {
                Some(current) if current.id == id => slot.take(),
                _ => None,
            }
        };
        if let Some(service) = removed {
            let residual = service.mailbox.len();
            if residual > 0 {
                debug!(service = %id, residual, "dropping undelivered messages");
            }
            debug!(service = %id, "service deleted");
        }
        Ok(())
    }

    /// Status of `id`; unknown ids read as `Dead`
    pub fn status(&self, id: ServiceId) -> ServiceStatus {
        self.get(id).map_or(ServiceStatus::Dead, |s| s.status())
    }

    pub(crate) fn set_status(&self, id: ServiceId, status: ServiceStatus) {
        if let Some(s) = self.get(id) {
            s.set_status(status);
        }
    }

    pub(crate) fn transition(&self, id: ServiceId, from: ServiceStatus, to: ServiceStatus) -> bool {
        self.get(id).is_some_and(|s| s.transition(from, to))
    }

    /// Label given at init
    pub fn label(&self, id: ServiceId) -> Option<String> {
        self.get(id).map(|s| s.label().to_string())
    }

    /// Deliver `msg` into the mailbox of `msg.to`
    pub fn push_message(&self, msg: Message) -> std::result::Result<(), PushError> {
        let Some(s) = self.get(msg.to) else {
            return Err(PushError::Dead(msg));
        };
        if s.status() == ServiceStatus::Dead {
            return Err(PushError::Dead(msg));
        }
        s.mailbox.push(msg).map_err(PushError::Blocked)
    }

    /// Next inbound item: the pending receipt first, then the mailbox
    pub fn pop_message(&self, id: ServiceId) -> Option<Inbound> {
        let s = self.get(id)?;
        if let Some(receipt) = s.receipt.lock().take() {
            return Some(Inbound::Receipt(receipt));
        }
        s.mailbox.pop().map(Inbound::Message)
    }

    /// Receipt plus mailbox items waiting
    pub fn message_count(&self, id: ServiceId) -> usize {
        self.get(id).map_or(0, |s| {
            usize::from(s.receipt.lock().is_some()) + s.mailbox.len()
        })
    }

    /// Whether `pop_message` would yield something
    pub fn has_message(&self, id: ServiceId) -> bool {
        self.message_count(id) > 0
    }

    /// Place `msg` in the single outbox slot of `msg.from`
    pub fn send_out(&self, msg: Message) -> std::result::Result<(), SendError> {
        let Some(s) = self.get(msg.from) else {
            return Err(SendError::NoService(msg));
        };
        let mut outbox = s.outbox.lock();
        if outbox.is_some() {
            return Err(SendError::OutboxOccupied(msg));
        }
        *outbox = Some(msg);
        Ok(())
    }

    /// Take the pending outbound message
    pub fn take_outbox(&self, id: ServiceId) -> Option<Message> {
        self.get(id)?.outbox.lock().take()
    }

    /// Put a message back into the outbox, discarding (with a warning)
    /// whatever was there.
    pub(crate) fn restore_outbox(&self, id: ServiceId, msg: Message) -> Option<Message> {
        let s = self.get(id)?;
        let previous = s.outbox.lock().replace(msg);
        if let Some(old) = &previous {
            warn!(service = %id, to = %old.to, "outbox overwritten, previous message discarded");
        }
        previous
    }

    /// Write the receipt slot. An unread receipt is discarded with a
    /// warning and returned.
    pub fn write_receipt(&self, id: ServiceId, receipt: Receipt) -> Option<Receipt> {
        let s = self.get(id)?;
        let previous = s.receipt.lock().replace(receipt);
        if let Some(old) = &previous {
            warn!(service = %id, kind = old.name(), "receipt overwritten, previous receipt discarded");
        }
        previous
    }

    /// Take the receipt slot
    pub fn read_receipt(&self, id: ServiceId) -> Option<Receipt> {
        self.get(id)?.receipt.lock().take()
    }

    /// Worker this service is pinned to
    pub fn binding(&self, id: ServiceId) -> Option<usize> {
        self.get(id).and_then(|s| s.binding())
    }

    pub(crate) fn set_binding(&self, id: ServiceId, worker: Option<usize>) -> Result<()> {
        let s = self.require(id)?;
        s.binding.store(worker.unwrap_or(UNBOUND), Ordering::Release);
        Ok(())
    }

    /// Exclusive thread index owning this service
    pub fn exclusive_thread(&self, id: ServiceId) -> Option<usize> {
        self.get(id).and_then(|s| s.exclusive_thread())
    }

    pub(crate) fn set_exclusive(&self, id: ServiceId, thread: usize) -> Result<()> {
        let s = self.require(id)?;
        if !s.transition(ServiceStatus::Idle, ServiceStatus::Exclusive) {
            return Err(RuntimeError::InvalidStatus {
                id,
                status: s.status(),
            });
        }
        s.thread.store(thread, Ordering::Release);
        Ok(())
    }

    /// CPU time spent inside resumes
    pub fn cpu_cost(&self, id: ServiceId) -> Duration {
        self.get(id)
            .map_or(Duration::ZERO, |s| Duration::from_nanos(s.cpu_nanos.load(Ordering::Relaxed)))
    }

    /// Memory limit in bytes (0 = unlimited)
    pub fn mem_limit(&self, id: ServiceId) -> usize {
        self.get(id).map_or(0, |s| s.mem_limit.load(Ordering::Relaxed))
    }

    /// Set the memory limit, returning the previous one
    pub fn set_mem_limit(&self, id: ServiceId, limit: usize) -> usize {
        self.get(id)
            .map_or(0, |s| s.mem_limit.swap(limit, Ordering::Relaxed))
    }

    /// Memory accounting captured after the last resume
    pub fn memory_stats(&self, id: ServiceId) -> MemoryStats {
        self.get(id).map(|s| s.memory.lock().clone()).unwrap_or_default()
    }

    /// Run one quantum of `id`.
    ///
    /// A missing context or an engine error counts as termination; errors
    /// go to the diagnostics sink with the context's backtrace.
    pub(crate) fn resume(&self, id: ServiceId, cx: &mut ServiceContext<'_>) -> Resume {
        let Some(s) = self.get(id) else {
            return Resume::Terminated;
        };
        let Some(mut context) = s.context.lock().take() else {
            warn!(service = %id, "resume without an execution context");
            return Resume::Terminated;
        };

        let start = Instant::now();
        let result = context.resume(cx);
        let elapsed = start.elapsed().as_nanos() as u64;
        s.cpu_nanos.fetch_add(elapsed, Ordering::Relaxed);

        let stats = context.memory_stats();
        {
            let mut memory = s.memory.lock();
            let high_water = memory.high_water.max(stats.high_water);
            *memory = stats;
            memory.high_water = high_water;
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let backtrace = context.backtrace();
                self.diagnostics.fault(id, &e, &backtrace);
                Resume::Terminated
            }
        };
        *s.context.lock() = Some(context);
        outcome
    }

    /// Mark a service dead unless it is mid-quantum
    pub fn hang(&self, id: ServiceId) -> Result<HangOutcome> {
        let s = self.require(id)?;
        let outcome = s.update_status(|status| match status {
            ServiceStatus::Running => None,
            _ => Some(ServiceStatus::Dead),
        });
        match outcome {
            Ok(previous) => {
                debug!(service = %id, from = %previous, "service hung");
                Ok(HangOutcome::Hung)
            }
            Err(_) => Ok(HangOutcome::Busy),
        }
    }

    /// Drain and delete a dead service.
    ///
    /// Returns `(from, session)` for every `Request`/`System` message that
    /// will never be answered, so the caller can report errors back.
    pub fn close(&self, id: ServiceId) -> Result<Vec<(ServiceId, Session)>> {
        let s = self.require(id)?;
        if s.status() != ServiceStatus::Dead {
            return Err(RuntimeError::NotDead(id));
        }
        let mut unanswered = Vec::new();
        s.receipt.lock().take();
        while let Some(msg) = s.mailbox.pop() {
            if matches!(msg.kind, MessageType::Request | MessageType::System) {
                unanswered.push((msg.from, msg.session));
            }
        }
        drop(s);
        self.delete(id)?;
        Ok(unanswered)
    }
}
