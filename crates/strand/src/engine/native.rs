//! Native engine: services written as Rust state machines
//!
//! A program is registered under a name; `load(name)` instantiates it. Each
//! resume calls [`Program::step`] once. Panics inside a step are caught and
//! turned into faults, so a misbehaving service dies alone.

use super::{Engine, EngineError, ExecutionContext, MemoryStats, Resume};
use crate::context::ServiceContext;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// What a program step asks the scheduler to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Suspend until there is more work
    Yield,
    /// Terminate normally
    Exit,
    /// Terminate with an error
    Fail(String),
}

/// A resumable service body
pub trait Program: Send {
    /// Run one slice of work
    fn step(&mut self, cx: &mut ServiceContext<'_>) -> Step;

    /// Bytes this program accounts as in use
    fn memory_used(&self) -> usize {
        0
    }

    /// Live objects by type, for memory reports
    fn object_counts(&self) -> Vec<(String, usize)> {
        Vec::new()
    }
}

impl<F> Program for F
where
    F: FnMut(&mut ServiceContext<'_>) -> Step + Send,
{
    fn step(&mut self, cx: &mut ServiceContext<'_>) -> Step {
        self(cx)
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn Program> + Send + Sync>;

/// Registry of named programs
#[derive(Clone, Default)]
pub struct NativeEngine {
    programs: Arc<FxHashMap<String, Factory>>,
}

impl NativeEngine {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program factory under `name`, replacing any previous one
    pub fn register<P, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        P: Program + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || Box::new(factory()) as Box<dyn Program>);
        Arc::make_mut(&mut self.programs).insert(name.into(), factory);
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_program<P, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        P: Program + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Registered program names
    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.programs().collect();
        names.sort_unstable();
        f.debug_struct("NativeEngine")
            .field("programs", &names)
            .finish()
    }
}

impl Engine for NativeEngine {
    fn create(&self) -> Result<Box<dyn ExecutionContext>, EngineError> {
        Ok(Box::new(NativeContext {
            programs: self.programs.clone(),
            name: None,
            program: None,
            steps: 0,
            high_water: 0,
            limit: 0,
            last_fault: None,
        }))
    }
}

struct NativeContext {
    programs: Arc<FxHashMap<String, Factory>>,
    name: Option<String>,
    program: Option<Box<dyn Program>>,
    steps: u64,
    high_water: usize,
    limit: usize,
    last_fault: Option<String>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ExecutionContext for NativeContext {
    fn load(&mut self, source: &str) -> Result<(), EngineError> {
        let factory = self
            .programs
            .get(source)
            .ok_or_else(|| EngineError::Load {
                source_name: source.to_string(),
                reason: "no such program".to_string(),
            })?;
        self.program = Some(factory());
        self.name = Some(source.to_string());
        Ok(())
    }

    fn resume(&mut self, cx: &mut ServiceContext<'_>) -> Result<Resume, EngineError> {
        let program = self.program.as_mut().ok_or(EngineError::NotLoaded)?;
        self.steps += 1;
        self.limit = cx.memory_limit();

        let step = panic::catch_unwind(AssertUnwindSafe(|| program.step(cx)));
        let used = program.memory_used();
        self.high_water = self.high_water.max(used);

        let step = match step {
            Ok(step) => step,
            Err(payload) => {
                let msg = panic_message(payload);
                self.last_fault = Some(format!("panic: {}", msg));
                self.program = None;
                return Err(EngineError::Panic(msg));
            }
        };
        if self.limit > 0 && used > self.limit {
            self.last_fault = Some(format!("memory {} > limit {}", used, self.limit));
            return Err(EngineError::MemoryLimit { limit: self.limit });
        }
        match step {
            Step::Yield => Ok(Resume::Yielded),
            Step::Exit => Ok(Resume::Terminated),
            Step::Fail(reason) => {
                self.last_fault = Some(reason.clone());
                Err(EngineError::Fault(reason))
            }
        }
    }

    fn backtrace(&self) -> String {
        let name = self.name.as_deref().unwrap_or("<unloaded>");
        match &self.last_fault {
            Some(fault) => format!("program '{}' at step {}: {}", name, self.steps, fault),
            None => format!("program '{}' at step {}", name, self.steps),
        }
    }

    fn memory_stats(&self) -> MemoryStats {
        let (used, objects) = match &self.program {
            Some(program) => (
                program.memory_used(),
                program.object_counts().into_iter().collect(),
            ),
            None => (0, Default::default()),
        };
        MemoryStats {
            used,
            high_water: self.high_water.max(used),
            limit: self.limit,
            objects,
        }
    }
}
