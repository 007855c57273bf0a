//! Service log queue and crash reports
//!
//! Services push log lines into a shared multi-producer queue; some logger
//! service pops them. Faults are logged through `tracing`, pushed into the
//! same queue and, when configured, written to a crash log file.

use crate::defaults::BACKTRACE_LIMIT;
use crate::message::ServiceId;
use crate::scheduler::timer::Timer;
use crossbeam::queue::SegQueue;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

/// One log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Timer ticks since the runtime started
    pub timestamp: u64,
    /// Originating service
    pub service: ServiceId,
    /// Raw log bytes
    pub data: Box<[u8]>,
}

impl LogRecord {
    /// Log bytes as text, lossily
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Destination of service log records
pub trait DiagnosticSink: Send + Sync {
    /// Accept a record
    fn push(&self, record: LogRecord);

    /// Take the oldest record, if the sink keeps them
    fn pop(&self) -> Option<LogRecord> {
        None
    }
}

/// Unbounded in-memory FIFO of records
#[derive(Debug, Default)]
pub struct LogQueue {
    queue: SegQueue<LogRecord>,
}

impl LogQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Records waiting
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl DiagnosticSink for LogQueue {
    fn push(&self, record: LogRecord) {
        self.queue.push(record);
    }

    fn pop(&self) -> Option<LogRecord> {
        self.queue.pop()
    }
}

pub(crate) struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    timer: Arc<Timer>,
    crashlog: Option<PathBuf>,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("crashlog", &self.crashlog)
            .finish()
    }
}

fn truncate_utf8(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

impl Diagnostics {
    pub(crate) fn new(
        sink: Arc<dyn DiagnosticSink>,
        timer: Arc<Timer>,
        crashlog: Option<PathBuf>,
    ) -> Self {
        Self {
            sink,
            timer,
            crashlog,
        }
    }

    pub(crate) fn push(&self, service: ServiceId, data: impl Into<Box<[u8]>>) {
        self.sink.push(LogRecord {
            timestamp: self.timer.now(),
            service,
            data: data.into(),
        });
    }

    pub(crate) fn pop(&self) -> Option<LogRecord> {
        self.sink.pop()
    }

    /// Record a service fault
    pub(crate) fn fault(&self, service: ServiceId, reason: &dyn fmt::Display, backtrace: &str) {
        let mut report = format!("{}\n{}", reason, backtrace);
        truncate_utf8(&mut report, BACKTRACE_LIMIT);
        error!(service = %service, "service fault: {}", reason);
        if let Some(path) = &self.crashlog {
            if let Err(e) = std::fs::write(path, report.as_bytes()) {
                warn!(path = %path.display(), "cannot write crash log: {}", e);
            }
        }
        self.push(service, report.into_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn diagnostics(crashlog: Option<PathBuf>) -> (Arc<LogQueue>, Diagnostics) {
        let queue = Arc::new(LogQueue::new());
        let timer = Arc::new(Timer::new(Duration::from_millis(10)));
        let diag = Diagnostics::new(queue.clone(), timer, crashlog);
        (queue, diag)
    }

    #[test]
    fn test_push_pop_order() {
        let (queue, diag) = diagnostics(None);
        diag.push(ServiceId::new(2), b"first".to_vec());
        diag.push(ServiceId::new(3), b"second".to_vec());
        assert_eq!(queue.len(), 2);
        let first = diag.pop().unwrap();
        assert_eq!(first.service, ServiceId::new(2));
        assert_eq!(first.text(), "first");
        assert_eq!(diag.pop().unwrap().text(), "second");
        assert!(diag.pop().is_none());
    }

    #[test]
    fn test_fault_writes_crashlog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.log");
        let (queue, diag) = diagnostics(Some(path.clone()));
        diag.fault(ServiceId::new(5), &"bad state", "program 'x' at step 3");
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "bad state\nprogram 'x' at step 3");
        assert_eq!(queue.pop().unwrap().service, ServiceId::new(5));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let mut text = "aé".to_string();
        truncate_utf8(&mut text, 2);
        assert_eq!(text, "a");
    }
}
