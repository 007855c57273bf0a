//! Runtime configuration
//!
//! Loaded from a TOML table (or built in code), then normalized: sizes are
//! rounded up to powers of two and a zero worker count resolves to the
//! number of cores minus one.

use crate::defaults::{
    DEFAULT_MAX_SERVICE, DEFAULT_QUEUE, DEFAULT_QUEUE_SENDING, DEFAULT_TICK_MS, MAX_WORKER,
};
use crate::error::{Result, RuntimeError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Sizing and behaviour knobs of a runtime
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker threads (0 = cores - 1)
    pub worker: usize,

    /// Mailbox ring size per service
    pub queue: usize,

    /// Sending queue size per exclusive thread
    pub queue_sending: usize,

    /// Service slot table size
    pub max_service: usize,

    /// Capacity of the external ingestion channel (0 = no channel)
    pub external_queue: usize,

    /// File that receives the backtrace of a faulting service
    pub crashlog: Option<PathBuf>,

    /// Timer wheel resolution in milliseconds
    pub tick_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker: 0,
            queue: DEFAULT_QUEUE,
            queue_sending: DEFAULT_QUEUE_SENDING,
            max_service: DEFAULT_MAX_SERVICE,
            external_queue: 0,
            crashlog: None,
            tick_ms: DEFAULT_TICK_MS,
        }
    }
}

fn align_pow2(x: usize) -> usize {
    x.max(2).next_power_of_two()
}

impl RuntimeConfig {
    /// Config with an explicit worker count and defaults elsewhere
    pub fn with_workers(worker: usize) -> Self {
        Self {
            worker,
            ..Self::default()
        }
    }

    /// Parse a TOML document whose top level is the config table
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(text)?;
        config.normalized()
    }

    /// Read and parse a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Resolve defaults and validate ranges.
    pub fn normalized(mut self) -> Result<Self> {
        if self.worker == 0 {
            self.worker = num_cpus::get().saturating_sub(1).max(1);
        }
        if self.worker > MAX_WORKER {
            return Err(RuntimeError::Config(format!(
                "worker = {} exceeds the limit of {}",
                self.worker, MAX_WORKER
            )));
        }
        if self.tick_ms == 0 {
            return Err(RuntimeError::Config("tick_ms must be positive".into()));
        }
        self.queue = align_pow2(self.queue);
        self.queue_sending = align_pow2(self.queue_sending);
        self.max_service = align_pow2(self.max_service);
        if self.max_service > u32::MAX as usize / 2 {
            return Err(RuntimeError::Config(format!(
                "max_service = {} is too large",
                self.max_service
            )));
        }
        if self.external_queue > 0 {
            self.external_queue = align_pow2(self.external_queue);
        }
        Ok(self)
    }
}
