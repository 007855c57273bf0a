//! One scheduling pass and message routing
//!
//! Everything here runs under the owner token. The ready queue and the
//! binding queues have a single producer and a single consumer at any time
//! because only the owner touches them.

use super::timer::TimerEvent;
use super::Shared;
use crate::defaults::{BINDING_QUEUE, SENDING_BLOCKED};
use crate::event::WakeEvent;
use crate::message::{Message, MessageType, Receipt, ServiceId};
use crate::queue::RingQueue;
use crate::service::{PushError, ServiceStatus};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

/// Scheduler state that only the owner may touch
pub(crate) struct DispatchState {
    pub(crate) ready: RingQueue<ServiceId>,
    pub(crate) binding: Box<[RingQueue<ServiceId>]>,
    /// Ids that did not fit in `ready`; re-queued first next pass
    deferred: VecDeque<ServiceId>,
    done: Vec<ServiceId>,
    prepare: Vec<ServiceId>,
    cursor: usize,
    external_pending: Option<Message>,
    timer_pending: VecDeque<Message>,
    timer_due: Vec<TimerEvent>,
}

impl DispatchState {
    pub(crate) fn new(max_service: usize, workers: usize) -> Self {
        Self {
            ready: RingQueue::new(max_service.max(2)),
            binding: (0..workers)
                .map(|_| RingQueue::new(BINDING_QUEUE))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            deferred: VecDeque::new(),
            done: Vec::with_capacity(workers),
            prepare: Vec::with_capacity(workers),
            cursor: 0,
            external_pending: None,
            timer_pending: VecDeque::new(),
            timer_due: Vec::new(),
        }
    }

    /// Ids waiting for a worker
    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len() + self.deferred.len()
    }
}

/// Outbound batch flushed by [`Shared::flush_sending`]
pub(crate) trait SendingQueue {
    fn pending(&self) -> usize;
    fn take(&mut self) -> Option<Message>;
    fn defer(&mut self, msg: Message);
}

impl SendingQueue for VecDeque<Message> {
    fn pending(&self) -> usize {
        self.len()
    }

    fn take(&mut self) -> Option<Message> {
        self.pop_front()
    }

    fn defer(&mut self, msg: Message) {
        self.push_back(msg);
    }
}

impl SendingQueue for &RingQueue<Message> {
    fn pending(&self) -> usize {
        self.len()
    }

    fn take(&mut self) -> Option<Message> {
        self.pop()
    }

    fn defer(&mut self, msg: Message) {
        // The matching take() freed a slot and producers are locked out.
        if let Err(msg) = self.push(msg) {
            error!(to = %msg.to, "sending queue overflow, message dropped");
        }
    }
}

/// Targets found blocked during one flush. Past capacity every target
/// counts as blocked.
pub(crate) struct BlockedSet {
    ids: [ServiceId; SENDING_BLOCKED],
    n: usize,
    saturated: bool,
}

impl BlockedSet {
    pub(crate) fn new() -> Self {
        Self {
            ids: [ServiceId::SYSTEM; SENDING_BLOCKED],
            n: 0,
            saturated: false,
        }
    }

    pub(crate) fn contains(&self, id: ServiceId) -> bool {
        self.saturated || self.ids[..self.n].contains(&id)
    }

    pub(crate) fn mark(&mut self, id: ServiceId) {
        if self.n == SENDING_BLOCKED {
            self.saturated = true;
        } else {
            self.ids[self.n] = id;
            self.n += 1;
        }
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.saturated
    }
}

impl Shared {
    /// Put a ready id back on the ready queue
    pub(crate) fn schedule_back(&self, st: &mut DispatchState, id: ServiceId) {
        debug_assert!(!id.is_system());
        if let Err(id) = st.ready.push(id) {
            warn!(service = %id, "ready queue full, deferring");
            st.deferred.push_back(id);
        }
    }

    /// A message landed in `to`'s mailbox: make sure someone runs it.
    pub(crate) fn check_message_to(&self, st: &mut DispatchState, to: ServiceId) {
        let Some(s) = self.pool.get(to) else {
            return;
        };
        match s.status() {
            ServiceStatus::Idle => {
                if s.transition(ServiceStatus::Idle, ServiceStatus::Schedule) {
                    trace!(service = %to, "in schedule");
                    self.schedule_back(st, to);
                }
            }
            ServiceStatus::Exclusive => {
                if let Some(thread) = s.exclusive_thread().and_then(|t| self.exclusive(t)) {
                    trace!(service = %to, "message to exclusive service");
                    thread.event.trigger();
                }
            }
            _ => {}
        }
    }

    /// Route the single outbound message of `from`, leaving a receipt.
    pub(crate) fn dispatch_out_message(&self, st: &mut DispatchState, from: ServiceId, msg: Message) {
        trace!(from = %from, to = %msg.to, kind = ?msg.kind, "route message");
        if msg.to.is_system() {
            self.dispatch_schedule_message(from, msg);
            return;
        }
        let to = msg.to;
        let receipt = match self.pool.push_message(msg) {
            Ok(()) => Receipt::Done,
            Err(PushError::Blocked(msg)) => Receipt::Block(msg),
            Err(PushError::Dead(msg)) => Receipt::Error(Some(msg)),
        };
        let delivered = receipt == Receipt::Done;
        self.pool.write_receipt(from, receipt);
        if delivered {
            self.check_message_to(st, to);
        }
    }

    /// Control messages addressed to SYSTEM; root only.
    fn dispatch_schedule_message(&self, from: ServiceId, msg: Message) {
        if !from.is_root() {
            warn!(from = %from, kind = ?msg.kind, "control message from non-root service");
            self.pool.write_receipt(from, Receipt::Error(Some(msg)));
            return;
        }
        let target = ServiceId::new(msg.session);
        let receipt = match msg.kind {
            MessageType::ScheduleNew => {
                let requested = (!target.is_system()).then_some(target);
                match self.pool.new_service(requested) {
                    Ok(id) => {
                        debug!(service = %id, "new service");
                        Receipt::Response(id)
                    }
                    Err(e) => {
                        debug!("new service refused: {}", e);
                        Receipt::Error(Some(msg))
                    }
                }
            }
            MessageType::ScheduleDelete => match self.pool.delete(target) {
                Ok(()) => {
                    debug!(service = %target, "delete service");
                    Receipt::Done
                }
                Err(e) => {
                    debug!(service = %target, "delete refused: {}", e);
                    Receipt::Error(Some(msg))
                }
            },
            _ => Receipt::Error(Some(msg)),
        };
        self.pool.write_receipt(from, receipt);
    }

    /// Deliver a batch, keeping per-target order: once a target blocks,
    /// later messages to it stay queued.
    pub(crate) fn flush_sending(&self, st: &mut DispatchState, queue: &mut impl SendingQueue) {
        let len = queue.pending();
        let mut blocked = BlockedSet::new();
        for _ in 0..len {
            let Some(msg) = queue.take() else {
                break;
            };
            if blocked.contains(msg.to) {
                queue.defer(msg);
                continue;
            }
            let to = msg.to;
            match self.pool.push_message(msg) {
                Ok(()) => self.check_message_to(st, to),
                Err(PushError::Blocked(msg)) => {
                    trace!(to = %to, "target blocked, message requeued");
                    queue.defer(msg);
                    blocked.mark(to);
                }
                Err(PushError::Dead(msg)) => {
                    debug!(from = %msg.from, to = %to, "message to dead service dropped");
                }
            }
        }
        if blocked.is_saturated() {
            trace!("blocked set saturated, rest of batch deferred");
        }
    }

    fn collect_done_jobs(&self, st: &mut DispatchState) {
        for w in self.workers.iter() {
            if let Some(id) = w.done.take() {
                trace!(service = %id, worker = w.index, "service is done");
                st.done.push(id);
            }
        }
    }

    fn drive_timer(&self, st: &mut DispatchState) {
        let mut due = std::mem::take(&mut st.timer_due);
        self.timer.update(&mut due);
        for ev in due.drain(..) {
            st.timer_pending.push_back(Message::new(
                ServiceId::SYSTEM,
                ev.service,
                ev.session,
                MessageType::Response,
            ));
        }
        st.timer_due = due;
        if !st.timer_pending.is_empty() {
            let mut pending = std::mem::take(&mut st.timer_pending);
            self.flush_sending(st, &mut pending);
            st.timer_pending = pending;
        }
    }

    fn drain_external(&self, st: &mut DispatchState) {
        let Some(rx) = &self.external else {
            return;
        };
        loop {
            let msg = match st.external_pending.take() {
                Some(msg) => msg,
                None => match rx.try_recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };
            let to = msg.to;
            match self.pool.push_message(msg) {
                Ok(()) => self.check_message_to(st, to),
                Err(PushError::Blocked(msg)) => {
                    trace!(to = %to, "external message retained");
                    st.external_pending = Some(msg);
                    break;
                }
                Err(PushError::Dead(_)) => {
                    warn!(to = %to, "external message to missing service dropped");
                }
            }
        }
    }

    fn forward_signal(&self, st: &mut DispatchState, id: ServiceId) {
        match self.pool.take_outbox(id) {
            Some(signal) if signal.kind == MessageType::Signal && signal.to.is_root() => {
                match self.pool.push_message(signal) {
                    Ok(()) => {
                        debug!(service = %id, "signal dead to root");
                        self.check_message_to(st, ServiceId::ROOT);
                    }
                    Err(PushError::Blocked(signal)) => {
                        debug!(service = %id, "root is blocked, signal later");
                        self.pool.restore_outbox(id, signal);
                        self.schedule_back(st, id);
                    }
                    Err(PushError::Dead(_)) => {
                        warn!(service = %id, "root service is missing");
                        let _ = self.pool.delete(id);
                    }
                }
            }
            Some(msg) => {
                debug!(service = %id, to = %msg.to, "outbound message of dead service dropped");
            }
            None => trace!(service = %id, "dead service has nothing to signal"),
        }
    }

    fn route_done(&self, st: &mut DispatchState, id: ServiceId) {
        let Some(s) = self.pool.get(id) else {
            trace!(service = %id, "done service is gone");
            return;
        };
        match s.status() {
            ServiceStatus::Dead => self.forward_signal(st, id),
            ServiceStatus::Done => {
                if let Some(msg) = self.pool.take_outbox(id) {
                    self.dispatch_out_message(st, id, msg);
                }
                if self.pool.has_message(id) {
                    if s.transition(ServiceStatus::Done, ServiceStatus::Schedule) {
                        trace!(service = %id, "back to schedule");
                        self.schedule_back(st, id);
                    }
                } else if s.transition(ServiceStatus::Done, ServiceStatus::Idle) {
                    trace!(service = %id, "idle");
                }
            }
            other => trace!(service = %id, status = %other, "done job skipped"),
        }
    }

    fn route_done_jobs(&self, st: &mut DispatchState) {
        let mut done = std::mem::take(&mut st.done);
        for id in done.drain(..) {
            self.route_done(st, id);
        }
        st.done = done;
    }

    fn retry_deferred(&self, st: &mut DispatchState) {
        while let Some(id) = st.deferred.pop_front() {
            if let Err(id) = st.ready.push(id) {
                st.deferred.push_front(id);
                break;
            }
        }
    }

    /// Hand the head of worker `index`'s binding queue to it if its ready
    /// slot is empty.
    fn assign_bound(&self, st: &mut DispatchState, index: usize) -> bool {
        let w = &self.workers[index];
        if !w.ready.is_empty() {
            return false;
        }
        let Some(id) = st.binding[index].pop() else {
            return false;
        };
        if w.ready.try_put(id) {
            trace!(service = %id, worker = index, "assign bound service");
            w.wakeup();
            true
        } else {
            self.schedule_back(st, id);
            false
        }
    }

    /// Count idle ready slots; workers with bound work get it first.
    fn count_free_slots(&self, st: &mut DispatchState) -> usize {
        let mut free = 0;
        for i in 0..self.workers.len() {
            if !self.workers[i].ready.is_empty() {
                continue;
            }
            if st.binding[i].is_empty() {
                free += 1;
            } else {
                self.assign_bound(st, i);
            }
        }
        free
    }

    fn prepare_jobs(&self, st: &mut DispatchState, mut free: usize) {
        st.prepare.clear();
        let mut i = 0;
        while i < free {
            i += 1;
            let Some(id) = st.ready.pop() else {
                break;
            };
            match self.pool.binding(id) {
                Some(w) if w < self.workers.len() => {
                    if let Err(id) = st.binding[w].push(id) {
                        trace!(service = %id, worker = w, "binding queue full");
                        self.schedule_back(st, id);
                    } else if self.assign_bound(st, w) {
                        free -= 1;
                    }
                }
                _ => st.prepare.push(id),
            }
        }
    }

    fn assign_prepared(&self, st: &mut DispatchState) -> usize {
        let n = self.workers.len();
        let mut assigned = 0;
        let prepare = std::mem::take(&mut st.prepare);
        for &id in &prepare {
            let mut placed = false;
            for k in 0..n {
                let index = (st.cursor + k) % n;
                let w = &self.workers[index];
                if w.ready.try_put(id) {
                    trace!(service = %id, worker = index, "assign");
                    st.cursor = (index + 1) % n;
                    w.wakeup();
                    placed = true;
                    assigned += 1;
                    break;
                }
            }
            if !placed {
                self.schedule_back(st, id);
            }
        }
        st.prepare = prepare;
        assigned
    }

    fn wakeup_sleeping_workers(&self, jobs: usize) {
        if jobs == 0 {
            return;
        }
        let total = self.workers.len();
        let active = self.active_workers.load(Ordering::Acquire);
        let mut wakeup = jobs.min(total.saturating_sub(active));
        for w in self.workers.iter() {
            if wakeup == 0 {
                break;
            }
            if w.bound().is_none() && w.wakeup() {
                wakeup -= 1;
            }
        }
    }

    /// One full scheduling pass
    pub(crate) fn schedule_dispatch(&self, st: &mut DispatchState) {
        self.collect_done_jobs(st);
        self.drive_timer(st);
        self.drain_external(st);
        self.route_done_jobs(st);
        self.retry_deferred(st);
        let free = self.count_free_slots(st);
        self.prepare_jobs(st, free);
        let assigned = self.assign_prepared(st);
        if assigned > 0 {
            trace!(assigned, waiting = st.ready_len(), "pass assigned jobs");
        }
        self.wakeup_sleeping_workers(assigned);
    }
}
