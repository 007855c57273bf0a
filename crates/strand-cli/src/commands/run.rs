//! `strand run`: execute a scenario until its root service exits.

use crate::programs::build_engine;
use crate::scenario::Scenario;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use strand::{Message, MessageType, Runtime, ServiceId};
use tracing::info;

pub struct RunArgs<'a> {
    pub scenario: &'a Path,
    pub workers: Option<usize>,
}

pub fn execute(args: RunArgs<'_>) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(args.scenario)?;
    let plan = scenario.plan()?;
    let engine = build_engine(&plan)?;

    let mut config = scenario.runtime.clone();
    if let Some(workers) = args.workers {
        config.worker = workers;
    }
    let runtime = Runtime::new(config, Arc::new(engine))?;
    info!(
        workers = runtime.worker_count(),
        services = plan.len(),
        "scenario {} loaded",
        args.scenario.display()
    );

    for planned in &plan {
        let source = planned.source();
        runtime
            .new_service(&planned.spec.label, &source, Some(planned.id), planned.spec.worker)
            .with_context(|| format!("cannot start service '{}'", planned.spec.label))?;
        if planned.spec.exclusive {
            let index = runtime.new_exclusive(planned.id)?;
            info!(service = %planned.id, index, "exclusive thread reserved");
        }
    }

    // Wake every non-root service once; root is scheduled by run().
    for planned in plan.iter().filter(|p| p.id != ServiceId::ROOT) {
        let kick = Message::new(ServiceId::SYSTEM, planned.id, 0, MessageType::System);
        if let Err(e) = runtime.post_message(kick) {
            anyhow::bail!("cannot wake service '{}': {}", planned.spec.label, e);
        }
    }

    let started = Instant::now();
    runtime.run()?;
    let elapsed = started.elapsed();

    while let Some(record) = runtime.pop_log() {
        println!("[{:>8}] {} {}", record.timestamp, record.service, record.text());
    }
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        jobs = ?runtime.worker_jobs(),
        "scenario finished"
    );
    Ok(())
}
