//! Per-service record

use crate::engine::{ExecutionContext, MemoryStats};
use crate::message::{Message, Receipt, ServiceId};
use crate::queue::RingQueue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceStatus {
    /// Slot allocated, no context yet
    Uninitialized = 0,
    /// Initialized, nothing to do
    Idle = 1,
    /// Waiting in a ready/binding queue or a worker slot
    Schedule = 2,
    /// Being resumed by a worker
    Running = 3,
    /// Resumed and yielded; the scheduler still has to route its outbox
    Done = 4,
    /// Terminated, faulted or hung
    Dead = 5,
    /// Pinned to an exclusive thread; never scheduled
    Exclusive = 6,
}

impl ServiceStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServiceStatus::Uninitialized,
            1 => ServiceStatus::Idle,
            2 => ServiceStatus::Schedule,
            3 => ServiceStatus::Running,
            4 => ServiceStatus::Done,
            5 => ServiceStatus::Dead,
            _ => ServiceStatus::Exclusive,
        }
    }

    /// Short lowercase name
    pub fn name(self) -> &'static str {
        match self {
            ServiceStatus::Uninitialized => "uninitialized",
            ServiceStatus::Idle => "idle",
            ServiceStatus::Schedule => "schedule",
            ServiceStatus::Running => "running",
            ServiceStatus::Done => "done",
            ServiceStatus::Dead => "dead",
            ServiceStatus::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) const UNBOUND: usize = usize::MAX;

pub(crate) struct Service {
    pub(crate) id: ServiceId,
    status: AtomicU8,
    pub(crate) label: OnceLock<String>,
    /// Taken out for the duration of a resume
    pub(crate) context: Mutex<Option<Box<dyn ExecutionContext>>>,
    pub(crate) mailbox: RingQueue<Message>,
    pub(crate) outbox: Mutex<Option<Message>>,
    pub(crate) receipt: Mutex<Option<Receipt>>,
    /// Worker index or UNBOUND
    pub(crate) binding: AtomicUsize,
    /// Exclusive thread index or UNBOUND
    pub(crate) thread: AtomicUsize,
    pub(crate) cpu_nanos: AtomicU64,
    pub(crate) mem_limit: AtomicUsize,
    pub(crate) memory: Mutex<MemoryStats>,
}

impl Service {
    pub(crate) fn new(id: ServiceId, queue: usize) -> Self {
        Self {
            id,
            status: AtomicU8::new(ServiceStatus::Uninitialized as u8),
            label: OnceLock::new(),
            context: Mutex::new(None),
            mailbox: RingQueue::new(queue),
            outbox: Mutex::new(None),
            receipt: Mutex::new(None),
            binding: AtomicUsize::new(UNBOUND),
            thread: AtomicUsize::new(UNBOUND),
            cpu_nanos: AtomicU64::new(0),
            mem_limit: AtomicUsize::new(0),
            memory: Mutex::new(MemoryStats::default()),
        }
    }

    pub(crate) fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ServiceStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Compare-and-set; false when the current status is not `from`
    pub(crate) fn transition(&self, from: ServiceStatus, to: ServiceStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn update_status(
        &self,
        mut f: impl FnMut(ServiceStatus) -> Option<ServiceStatus>,
    ) -> Result<ServiceStatus, ServiceStatus> {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                f(ServiceStatus::from_u8(v)).map(|s| s as u8)
            })
            .map(ServiceStatus::from_u8)
            .map_err(ServiceStatus::from_u8)
    }

    pub(crate) fn label(&self) -> &str {
        self.label.get().map(String::as_str).unwrap_or("")
    }

    pub(crate) fn binding(&self) -> Option<usize> {
        match self.binding.load(Ordering::Acquire) {
            UNBOUND => None,
            w => Some(w),
        }
    }

    pub(crate) fn exclusive_thread(&self) -> Option<usize> {
        match self.thread.load(Ordering::Acquire) {
            UNBOUND => None,
            t => Some(t),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("label", &self.label())
            .field("status", &self.status())
            .field("mailbox", &self.mailbox.len())
            .finish()
    }
}
