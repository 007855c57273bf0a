//! Shared helpers for runtime integration tests

#![allow(dead_code)]

use crossbeam::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strand::{
    Inbound, Message, MessageType, NativeEngine, Runtime, RuntimeConfig, ServiceContext,
    ServiceId, Step,
};

/// Upper bound for any single runtime test
pub const DEADLINE: Duration = Duration::from_secs(20);

/// Small runtime config for tests
pub fn config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        worker: workers,
        queue: 64,
        max_service: 256,
        tick_ms: 5,
        ..RuntimeConfig::default()
    }
}

/// Run until root quits. Returns false if the watchdog had to stop it.
pub fn run_to_completion(rt: &Arc<Runtime>) -> bool {
    let (done_tx, done_rx) = channel::bounded::<()>(1);
    let watchdog = {
        let rt = rt.clone();
        thread::spawn(move || {
            if done_rx.recv_timeout(DEADLINE).is_err() {
                rt.shutdown();
                return false;
            }
            true
        })
    };
    rt.run().unwrap();
    let _ = done_tx.send(());
    watchdog.join().unwrap()
}

/// Kick a service before `run` with an empty request from SYSTEM
pub fn kick(rt: &Runtime, id: ServiceId, session: u32) {
    rt.post_message(Message::new(ServiceId::SYSTEM, id, session, MessageType::Request))
        .unwrap();
}

/// Root that quits as soon as it hears from `from`
pub fn root_waiting_for(engine: NativeEngine, from: ServiceId) -> NativeEngine {
    engine.with_program("root", move || {
        move |cx: &mut ServiceContext<'_>| {
            while let Some(item) = cx.recv() {
                if let Inbound::Message(m) = item {
                    if m.from == from {
                        return Step::Exit;
                    }
                }
            }
            Step::Yield
        }
    })
}
