//! Exclusive threads
//!
//! One OS thread per exclusive service. The service may block (for example
//! in `event_wait`) without holding up the worker pool. Besides its outbox
//! it has a bounded sending queue that several producers can feed under a
//! lock.

use super::owner::ThreadRole;
use super::Shared;
use crate::context::ServiceContext;
use crate::engine::Resume;
use crate::event::{CondvarEvent, WakeEvent};
use crate::message::{Message, ServiceId};
use crate::queue::RingQueue;
use crate::service::{SendError, ServiceStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Record of one exclusive thread
#[derive(Debug)]
pub(crate) struct ExclusiveThread {
    pub(crate) index: usize,
    pub(crate) service: ServiceId,
    sending: Mutex<RingQueue<Message>>,
    pub(crate) term: AtomicBool,
    pub(crate) event: CondvarEvent,
}

impl ExclusiveThread {
    pub(crate) fn new(index: usize, service: ServiceId, queue_sending: usize) -> Self {
        Self {
            index,
            service,
            sending: Mutex::new(RingQueue::new(queue_sending)),
            term: AtomicBool::new(false),
            event: CondvarEvent::new(),
        }
    }

    /// Queue a message for the next flush
    pub(crate) fn enqueue(&self, msg: Message) -> Result<(), SendError> {
        self.sending.lock().push(msg).map_err(SendError::QueueFull)
    }

    pub(crate) fn pending(&self) -> usize {
        self.sending.lock().len()
    }
}

impl Shared {
    /// Exclusive thread body
    pub(crate) fn exclusive_main(&self, index: usize) {
        let Some(thread) = self.exclusive(index) else {
            return;
        };
        let id = thread.service;
        let role = ThreadRole::Exclusive(index);
        debug!(service = %id, thread = index, "exclusive thread started");

        while !thread.term.load(Ordering::Acquire) {
            let mut cx = ServiceContext::new(self, id, role);
            if self.pool.resume(id, &mut cx) == Resume::Terminated {
                debug!(service = %id, "exclusive service quit");
                self.pool.set_status(id, ServiceStatus::Dead);
                if id.is_root() {
                    self.shutdown_all("root service quit");
                }
                break;
            }
            if self.pool.status(id) == ServiceStatus::Dead {
                debug!(service = %id, "exclusive service hung");
                break;
            }
            self.exclusive_message(index);
        }

        thread.event.close();
        self.thread_count.fetch_sub(1, Ordering::AcqRel);
        debug!(service = %id, thread = index, "exclusive thread quit");
    }

    /// Route the outbox and flush the sending queue, if there is anything.
    pub(crate) fn exclusive_message(&self, index: usize) {
        let Some(thread) = self.exclusive(index) else {
            return;
        };
        let id = thread.service;
        let out = self.pool.take_outbox(id);
        if out.is_none() && thread.pending() == 0 {
            return;
        }
        let mut owner = self.owner.acquire(ThreadRole::Exclusive(index));
        if let Some(msg) = out {
            self.dispatch_out_message(&mut owner, id, msg);
        }
        {
            let sending = thread.sending.lock();
            let mut queue: &RingQueue<Message> = &sending;
            self.flush_sending(&mut owner, &mut queue);
        }
        self.schedule_dispatch(&mut owner);
    }
}
