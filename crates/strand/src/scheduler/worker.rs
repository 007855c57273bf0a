//! Worker threads
//!
//! Each worker owns two single-item slots: `ready` (written by the scheduler
//! owner, emptied by the worker or a thief) and `done` (written by the
//! worker, emptied by the owner). A worker runs one service per round, then
//! tries to become owner and run a scheduling pass itself.

use super::owner::ThreadRole;
use super::Shared;
use crate::context::ServiceContext;
use crate::engine::Resume;
use crate::event::{CondvarEvent, WakeEvent};
use crate::message::{Message, ServiceId};
use crate::service::ServiceStatus;
use crossbeam::utils::Backoff;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Single-item atomic job slot; 0 means empty
#[derive(Debug, Default)]
pub(crate) struct JobSlot(AtomicU32);

impl JobSlot {
    pub(crate) fn peek(&self) -> Option<ServiceId> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            id => Some(ServiceId::new(id)),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    /// Empty the slot, returning what was there
    pub(crate) fn take(&self) -> Option<ServiceId> {
        match self.0.swap(0, Ordering::AcqRel) {
            0 => None,
            id => Some(ServiceId::new(id)),
        }
    }

    /// Fill the slot if it is empty
    pub(crate) fn try_put(&self, id: ServiceId) -> bool {
        debug_assert!(!id.is_system());
        self.0
            .compare_exchange(0, id.as_u32(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Empty the slot only if it still holds `id`
    pub(crate) fn steal(&self, id: ServiceId) -> bool {
        self.0
            .compare_exchange(id.as_u32(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn store(&self, id: Option<ServiceId>) {
        self.0
            .store(id.map_or(0, ServiceId::as_u32), Ordering::Release);
    }
}

/// Shared per-worker record
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub(crate) index: usize,
    pub(crate) ready: JobSlot,
    pub(crate) done: JobSlot,
    pub(crate) running: JobSlot,
    /// Last service run here that is bound to this worker
    bound: JobSlot,
    pub(crate) term: AtomicBool,
    pub(crate) event: CondvarEvent,
    pub(crate) jobs: AtomicU64,
}

impl WorkerSlot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            ready: JobSlot::default(),
            done: JobSlot::default(),
            running: JobSlot::default(),
            bound: JobSlot::default(),
            term: AtomicBool::new(false),
            event: CondvarEvent::new(),
            jobs: AtomicU64::new(0),
        }
    }

    /// Wake the worker; true if it was asleep
    pub(crate) fn wakeup(&self) -> bool {
        self.event.trigger()
    }

    pub(crate) fn bound(&self) -> Option<ServiceId> {
        self.bound.peek()
    }
}

impl Shared {
    /// Worker thread body
    pub(crate) fn worker_main(&self, index: usize) {
        let me = &self.workers[index];
        let role = ThreadRole::Worker(index);
        self.active_workers.fetch_add(1, Ordering::AcqRel);
        debug!(worker = index, "worker started");

        loop {
            if me.term.load(Ordering::Acquire) {
                break;
            }
            if let Some(id) = me.ready.take() {
                me.running.store(Some(id));
                let keep_going = self.run_job(index, id);
                me.running.store(None);
                if !keep_going {
                    break;
                }
                self.publish_done(index, id);
                let bound = self.pool.binding(id) == Some(index);
                me.bound.store(bound.then_some(id));
                if let Some(mut owner) = self.owner.try_acquire(role) {
                    self.dispatch_for_worker(&mut owner, index);
                }
            } else {
                // Wait out the current owner: a pass must run after this
                // worker went idle, or its bound work could sit unassigned.
                let mut has_job = {
                    let mut owner = self.owner.acquire(role);
                    self.dispatch_for_worker(&mut owner, index)
                };
                if !has_job && !me.ready.is_empty() {
                    has_job = true;
                }
                if !has_job {
                    self.sleep_worker(index);
                }
            }
        }

        self.active_workers.fetch_sub(1, Ordering::AcqRel);
        self.thread_count.fetch_sub(1, Ordering::AcqRel);
        debug!(worker = index, "worker quit");
    }

    /// Resume one job. Returns false when the root service quit.
    fn run_job(&self, index: usize, id: ServiceId) -> bool {
        let Some(service) = self.pool.get(id) else {
            trace!(service = %id, "job vanished");
            return true;
        };
        if !service.transition(ServiceStatus::Schedule, ServiceStatus::Running) {
            trace!(service = %id, status = %service.status(), "job skipped");
            return true;
        }
        trace!(service = %id, worker = index, "run service");
        self.workers[index].jobs.fetch_add(1, Ordering::Relaxed);

        let mut cx = ServiceContext::new(self, id, ThreadRole::Worker(index));
        match self.pool.resume(id, &mut cx) {
            Resume::Yielded => service.set_status(ServiceStatus::Done),
            Resume::Terminated => {
                debug!(service = %id, "service quit");
                service.set_status(ServiceStatus::Dead);
                if id.is_root() {
                    self.shutdown_all("root service quit");
                    return false;
                }
                self.pool.restore_outbox(id, Message::signal_dead(id));
            }
        }
        true
    }

    /// Hand a finished job to the scheduler through the done slot.
    fn publish_done(&self, index: usize, id: ServiceId) {
        let me = &self.workers[index];
        let role = ThreadRole::Worker(index);
        let backoff = Backoff::new();
        while !me.done.try_put(id) {
            // The previous completion is still unread; collect it ourselves.
            if let Some(mut owner) = self.owner.try_acquire(role) {
                self.schedule_dispatch(&mut owner);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Scheduling pass on behalf of a worker, then steal if still idle.
    /// Returns true if the worker has a job afterwards.
    fn dispatch_for_worker(&self, st: &mut super::dispatch::DispatchState, index: usize) -> bool {
        self.schedule_dispatch(st);
        let me = &self.workers[index];
        if !me.ready.is_empty() {
            return true;
        }
        if me.bound().is_some() {
            return false;
        }
        match self.steal_job(index) {
            Some(job) => {
                trace!(service = %job, worker = index, "steal service");
                me.ready.try_put(job)
            }
            None => false,
        }
    }

    /// Claim a peer's assigned job, skipping jobs bound elsewhere.
    pub(crate) fn steal_job(&self, index: usize) -> Option<ServiceId> {
        let n = self.workers.len();
        if n < 2 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..n);
        for k in 0..n {
            let victim = (start + k) % n;
            if victim == index {
                continue;
            }
            let peer = &self.workers[victim];
            let Some(job) = peer.ready.peek() else {
                continue;
            };
            if let Some(w) = self.pool.binding(job) {
                if w != index {
                    continue;
                }
            }
            if peer.ready.steal(job) {
                return Some(job);
            }
        }
        None
    }

    fn sleep_worker(&self, index: usize) {
        let me = &self.workers[index];
        let remaining = self.active_workers.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            // Last one awake: look once more so a job queued meanwhile is
            // not left until the next wake-up.
            if let Some(mut owner) = self.owner.try_acquire(ThreadRole::Worker(index)) {
                self.schedule_dispatch(&mut owner);
            }
            if !me.ready.is_empty() || me.term.load(Ordering::Acquire) {
                self.active_workers.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }
        trace!(worker = index, sleeping = self.workers.len() - remaining, "sleeping");
        me.event.wait();
        self.active_workers.fetch_add(1, Ordering::AcqRel);
        trace!(worker = index, "wakeup");
    }
}
