//! Service-side API integration tests
//!
//! Timers, exclusive threads, external input, preinit takeover, faults and
//! root-only control operations, each driven through a real runtime.

mod common;

use common::{config, kick, root_waiting_for, run_to_completion};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strand::codec;
use strand::{
    EngineError, HangOutcome, Inbound, MessageType, NativeEngine, Program, Receipt, Runtime,
    RuntimeError, ServiceContext, ServiceId, ServiceStatus, Session, Step,
};

// ===== Timer =====

#[test]
fn test_timer_response_arrives_from_system() {
    let fired: Arc<Mutex<Option<(u32, u64, Duration)>>> = Arc::default();
    let out_of_range: Arc<Mutex<bool>> = Arc::default();

    let engine = {
        let fired = fired.clone();
        let out_of_range = out_of_range.clone();
        NativeEngine::new().with_program("root", move || {
            let fired = fired.clone();
            let out_of_range = out_of_range.clone();
            let mut armed_at = None;
            move |cx: &mut ServiceContext<'_>| {
                let Some((start, wall)) = armed_at else {
                    *out_of_range.lock() =
                        matches!(cx.timer_add(1, u64::MAX), Err(RuntimeError::TimerRange(_)));
                    armed_at = Some((cx.now().1, Instant::now()));
                    cx.timer_add(77, 3).unwrap();
                    return Step::Yield;
                };
                while let Some(item) = cx.recv() {
                    if let Inbound::Message(m) = item {
                        if m.from.is_system() && m.kind == MessageType::Response {
                            *fired.lock() = Some((m.session, cx.now().1 - start, wall.elapsed()));
                            return Step::Exit;
                        }
                    }
                }
                Step::Yield
            }
        })
    };

    let rt = Arc::new(Runtime::new(config(2), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();

    assert!(run_to_completion(&rt), "runtime did not finish");
    assert!(*out_of_range.lock());
    let (session, waited, wall) = fired.lock().expect("timer never fired");
    assert_eq!(session, 77);
    assert!(waited >= 3, "fired after {} ticks", waited);
    // 3 ticks of 5ms, less the part of a tick already gone when armed
    assert!(wall >= Duration::from_millis(10), "fired after {:?}", wall);
}

#[test]
fn test_timer_armed_after_long_quantum_waits_full_delay() {
    let fired: Arc<Mutex<Option<(Duration, u64)>>> = Arc::default();

    let engine = {
        let fired = fired.clone();
        NativeEngine::new().with_program("root", move || {
            let fired = fired.clone();
            let mut armed: Option<(Instant, u64)> = None;
            move |cx: &mut ServiceContext<'_>| {
                let Some((wall, start)) = armed else {
                    // No pass runs while this quantum blocks.
                    thread::sleep(Duration::from_millis(400));
                    armed = Some((Instant::now(), cx.now().1));
                    cx.timer_add(7, 40).unwrap();
                    return Step::Yield;
                };
                if !cx.event_wait().unwrap() {
                    return Step::Exit;
                }
                while let Some(item) = cx.recv() {
                    if let Inbound::Message(m) = item {
                        if m.from.is_system() && m.session == 7 {
                            *fired.lock() = Some((wall.elapsed(), cx.now().1 - start));
                            return Step::Exit;
                        }
                    }
                }
                Step::Yield
            }
        })
    };

    let rt = Arc::new(Runtime::new(config(1), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();
    rt.new_exclusive(ServiceId::ROOT).unwrap();

    assert!(run_to_completion(&rt), "runtime did not finish");
    let (wall, ticks) = fired.lock().expect("timer never fired");
    // 40 ticks of 5ms, less the part of a tick already gone when armed
    assert!(wall >= Duration::from_millis(195), "timer of 200ms fired after {:?}", wall);
    assert!(ticks >= 39, "clock moved {} ticks", ticks);
}

#[test]
fn test_service_log_queue() {
    let popped: Arc<Mutex<Option<(ServiceId, String)>>> = Arc::default();
    let engine = {
        let popped = popped.clone();
        NativeEngine::new().with_program("root", move || {
            let popped = popped.clone();
            move |cx: &mut ServiceContext<'_>| {
                cx.push_log(b"hello".to_vec());
                *popped.lock() = cx.pop_log().map(|r| (r.service, r.text().into_owned()));
                cx.push_log(b"left behind".to_vec());
                Step::Exit
            }
        })
    };

    let rt = Arc::new(Runtime::new(config(1), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();

    assert!(run_to_completion(&rt), "runtime did not finish");
    assert_eq!(*popped.lock(), Some((ServiceId::ROOT, "hello".to_string())));
    let rest = rt.pop_log().unwrap();
    assert_eq!(rest.text(), "left behind");
    assert!(rt.pop_log().is_none());
}

// ===== Exclusive threads =====

#[test]
fn test_exclusive_service_answers_through_sending_queue() {
    let echo = ServiceId::new(3);
    let report: Arc<Mutex<Vec<String>>> = Arc::default();

    let engine = {
        let report = report.clone();
        let echo_report = report.clone();
        NativeEngine::new()
            .with_program("root", move || {
                let report = report.clone();
                let mut sent = false;
                move |cx: &mut ServiceContext<'_>| {
                    if !sent {
                        cx.send(echo, 5, MessageType::Request, None).unwrap();
                        report.lock().push(format!("exclusive={}", cx.is_exclusive(echo)));
                        report.lock().push(format!("touch-root={}", cx.touch(ServiceId::ROOT).is_err()));
                        report.lock().push(format!("root-event-wait={}", cx.event_wait().is_err()));
                        sent = true;
                        return Step::Yield;
                    }
                    while let Some(item) = cx.recv() {
                        if let Inbound::Message(m) = item {
                            if m.from == echo && m.kind == MessageType::Response {
                                report.lock().push(format!("reply={}", m.session));
                                return Step::Exit;
                            }
                        }
                    }
                    Step::Yield
                }
            })
            .with_program("echo", move || {
                let report = echo_report.clone();
                move |cx: &mut ServiceContext<'_>| {
                    match cx.event_wait() {
                        Ok(true) => {}
                        _ => return Step::Exit,
                    }
                    while let Some(item) = cx.recv() {
                        if let Inbound::Message(m) = item {
                            if m.kind == MessageType::Request {
                                report.lock().push(format!("echo-worker={:?}", cx.worker_id()));
                                cx.exclusive_send(m.from, m.session, MessageType::Response, None)
                                    .unwrap();
                            }
                        }
                    }
                    Step::Yield
                }
            })
    };

    let rt = Arc::new(Runtime::new(config(2), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();
    rt.new_service("echo", "echo", Some(echo), None).unwrap();
    assert_eq!(rt.new_exclusive(echo).unwrap(), 0);
    assert_eq!(rt.status(echo), ServiceStatus::Exclusive);
    assert!(rt.new_exclusive(echo).is_err());

    assert!(run_to_completion(&rt), "runtime did not finish");
    let report = report.lock();
    assert!(report.contains(&"exclusive=true".to_string()));
    assert!(report.contains(&"touch-root=true".to_string()));
    assert!(report.contains(&"root-event-wait=true".to_string()));
    assert!(report.contains(&"echo-worker=None".to_string()));
    assert!(report.contains(&"reply=5".to_string()));
}

#[test]
fn test_send_direct_reports_immediately() {
    let target = ServiceId::new(4);
    let receipts: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let engine = {
        let receipts = receipts.clone();
        root_waiting_for(NativeEngine::new(), target)
            .with_program("sender", move || {
                let receipts = receipts.clone();
                move |cx: &mut ServiceContext<'_>| {
                    while cx.recv().is_some() {}
                    let r = cx.send_direct(target, 1, MessageType::Request, None);
                    receipts.lock().push(r.name());
                    let r = cx.send_direct(ServiceId::SYSTEM, 1, MessageType::ScheduleNew, None);
                    receipts.lock().push(r.name());
                    let r = cx.send_direct(ServiceId::new(99), 1, MessageType::Request, None);
                    receipts.lock().push(r.name());
                    Step::Exit
                }
            })
            .with_program("target", || {
                let mut notified = false;
                move |cx: &mut ServiceContext<'_>| {
                    while cx.recv().is_some() {}
                    if !notified {
                        cx.send(ServiceId::ROOT, 0, MessageType::Request, None).unwrap();
                        notified = true;
                    }
                    Step::Yield
                }
            })
    };

    let rt = Arc::new(Runtime::new(config(2), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();
    let sender = rt.new_service("sender", "sender", None, None).unwrap();
    rt.new_service("target", "target", Some(target), None).unwrap();
    kick(&rt, sender, 0);

    assert!(run_to_completion(&rt), "runtime did not finish");
    assert_eq!(*receipts.lock(), vec!["done", "error", "error"]);
}

// ===== External input =====

#[test]
fn test_external_messages_reach_root() {
    let received: Arc<Mutex<Vec<(Session, String)>>> = Arc::default();
    let engine = {
        let received = received.clone();
        NativeEngine::new().with_program("root", move || {
            let received = received.clone();
            move |cx: &mut ServiceContext<'_>| {
                while let Some(item) = cx.recv() {
                    if let Inbound::Message(m) = item {
                        let text: String = m
                            .payload
                            .as_ref()
                            .map(|p| codec::unpack(p).unwrap())
                            .unwrap_or_default();
                        received.lock().push((m.session, text));
                    }
                }
                if received.lock().len() == 3 {
                    Step::Exit
                } else {
                    Step::Yield
                }
            }
        })
    };

    let mut cfg = config(2);
    cfg.external_queue = 8;
    let rt = Arc::new(Runtime::new(cfg, Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();
    let sender = rt.external_sender().unwrap();
    sender
        .send(1, MessageType::Request, Some(codec::pack("first").unwrap()))
        .unwrap();
    let late = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        for session in 2..=3 {
            sender
                .send(session, MessageType::Request, Some(codec::pack("later").unwrap()))
                .unwrap();
        }
    });

    assert!(run_to_completion(&rt), "runtime did not finish");
    late.join().unwrap();
    let received = received.lock();
    assert_eq!(received[0], (1, "first".to_string()));
    assert_eq!(received[1..], [(2, "later".to_string()), (3, "later".to_string())]);
}

#[test]
fn test_external_channel_disabled_by_default() {
    let engine = NativeEngine::new();
    let rt = Runtime::new(config(1), Arc::new(engine)).unwrap();
    assert!(rt.external_sender().is_none());
}

// ===== Preinit =====

#[test]
fn test_preinit_context_is_moved_into_slot() {
    let engine = NativeEngine::new().with_program("root", || |_: &mut ServiceContext<'_>| Step::Exit);
    let rt = Arc::new(Runtime::new(config(1), Arc::new(engine)).unwrap());

    let handle = rt.preinit("root").unwrap();
    assert_eq!(handle.source(), "root");
    let id = rt
        .new_service_preinit("root", Some(ServiceId::ROOT), handle, None)
        .unwrap();
    assert_eq!(id, ServiceId::ROOT);
    assert_eq!(rt.pool().label(id).as_deref(), Some("root"));

    let before = rt.pool().len();
    let bad = rt.preinit("missing").unwrap();
    let err = rt.new_service_preinit("bad", None, bad, None).unwrap_err();
    assert!(matches!(err, RuntimeError::Engine(EngineError::Load { .. })));
    assert_eq!(rt.pool().len(), before);

    assert!(run_to_completion(&rt), "runtime did not finish");
}

#[test]
fn test_failed_load_releases_slot() {
    let engine = NativeEngine::new();
    let rt = Runtime::new(config(1), Arc::new(engine)).unwrap();
    let err = rt
        .new_service("ghost", "no-such-program", Some(ServiceId::new(7)), None)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Engine(_)));
    assert!(rt.pool().is_empty());
    assert!(rt
        .new_service("ghost", "no-such-program", None, Some(64))
        .is_err());
    assert!(rt.pool().is_empty());
}

// ===== Faults =====

#[test]
fn test_panicking_service_is_reported_and_closed() {
    let crash = ServiceId::new(2);
    let dir = tempfile::tempdir().unwrap();
    let crashlog = dir.path().join("crash.log");
    let unanswered: Arc<Mutex<Option<Vec<(ServiceId, Session)>>>> = Arc::default();

    let engine = {
        let unanswered = unanswered.clone();
        NativeEngine::new()
            .with_program("root", move || {
                let unanswered = unanswered.clone();
                move |cx: &mut ServiceContext<'_>| {
                    while let Some(item) = cx.recv() {
                        if let Inbound::Message(m) = item {
                            if m.from == crash && m.kind == MessageType::Signal {
                                *unanswered.lock() = Some(cx.close_service(crash).unwrap());
                                return Step::Exit;
                            }
                        }
                    }
                    Step::Yield
                }
            })
            .with_program("crash", || {
                |_: &mut ServiceContext<'_>| -> Step { panic!("boom") }
            })
    };

    let mut cfg = config(2);
    cfg.crashlog = Some(crashlog.clone());
    let rt = Arc::new(Runtime::new(cfg, Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();
    rt.new_service("crash", "crash", Some(crash), None).unwrap();
    kick(&rt, crash, 9);

    assert!(run_to_completion(&rt), "runtime did not finish");
    assert_eq!(*unanswered.lock(), Some(vec![(ServiceId::SYSTEM, 9)]));
    assert!(rt.pool().label(crash).is_none());
    let record = rt.pop_log().expect("fault was not logged");
    assert_eq!(record.service, crash);
    assert!(record.text().contains("boom"));
    let written = std::fs::read_to_string(&crashlog).unwrap();
    assert!(written.contains("boom"));
    assert!(written.contains("program 'crash'"));
}

struct Hog {
    stats: Arc<Mutex<Option<usize>>>,
    steps: u32,
}

impl Program for Hog {
    fn step(&mut self, cx: &mut ServiceContext<'_>) -> Step {
        self.steps += 1;
        while cx.recv().is_some() {}
        if self.steps == 1 {
            cx.mem_limit(500);
            cx.send(cx.id(), 1, MessageType::Request, None).unwrap();
        } else {
            *self.stats.lock() = Some(cx.mem_stats().used);
        }
        Step::Yield
    }

    fn memory_used(&self) -> usize {
        1000
    }
}

#[test]
fn test_memory_limit_kills_service() {
    let hog = ServiceId::new(2);
    let stats: Arc<Mutex<Option<usize>>> = Arc::default();
    let engine = {
        let stats = stats.clone();
        root_waiting_for(NativeEngine::new(), hog).with_program("hog", move || Hog {
            stats: stats.clone(),
            steps: 0,
        })
    };

    let rt = Arc::new(Runtime::new(config(2), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();
    rt.new_service("hog", "hog", Some(hog), None).unwrap();
    kick(&rt, hog, 0);

    assert!(run_to_completion(&rt), "runtime did not finish");
    assert_eq!(*stats.lock(), Some(1000));
    assert_eq!(rt.status(hog), ServiceStatus::Dead);
    let record = rt.pop_log().expect("fault was not logged");
    assert!(record.text().contains("memory limit"));
}

// ===== Root control =====

#[test]
fn test_root_creates_and_deletes_through_system() {
    let report: Arc<Mutex<Vec<String>>> = Arc::default();
    let engine = {
        let report = report.clone();
        NativeEngine::new()
            .with_program("child", || |_: &mut ServiceContext<'_>| Step::Yield)
            .with_program("root", move || {
                let report = report.clone();
                let mut state = 0;
                move |cx: &mut ServiceContext<'_>| {
                    match state {
                        0 => {
                            cx.send(ServiceId::SYSTEM, 0, MessageType::ScheduleNew, None)
                                .unwrap();
                            state = 1;
                        }
                        1 => {
                            let Some(Receipt::Response(child)) = cx.receipt() else {
                                return Step::Yield;
                            };
                            cx.init_service(child, "child", "child", None).unwrap();
                            report.lock().push(format!("status={}", cx.status(child)));
                            report.lock().push(format!("hang={:?}", cx.hang(child).unwrap()));
                            let unanswered = cx.close_service(child).unwrap();
                            report.lock().push(format!("unanswered={}", unanswered.len()));
                            report.lock().push(format!("after={}", cx.status(child)));
                            cx.send(ServiceId::SYSTEM, child.as_u32(), MessageType::ScheduleDelete, None)
                                .unwrap();
                            state = 2;
                        }
                        _ => {
                            if let Some(receipt) = cx.receipt() {
                                report.lock().push(format!("delete-again={}", receipt.name()));
                                return Step::Exit;
                            }
                        }
                    }
                    Step::Yield
                }
            })
    };

    let rt = Arc::new(Runtime::new(config(2), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();

    assert!(run_to_completion(&rt), "runtime did not finish");
    assert_eq!(
        *report.lock(),
        vec![
            "status=idle".to_string(),
            format!("hang={:?}", HangOutcome::Hung),
            "unanswered=0".to_string(),
            "after=dead".to_string(),
            "delete-again=error".to_string(),
        ]
    );
}

#[test]
fn test_non_root_cannot_control_services() {
    let rogue = ServiceId::new(2);
    let report: Arc<Mutex<Vec<String>>> = Arc::default();
    let engine = {
        let report = report.clone();
        root_waiting_for(NativeEngine::new(), rogue).with_program("rogue", move || {
            let report = report.clone();
            let mut sent = false;
            move |cx: &mut ServiceContext<'_>| {
                if !sent {
                    while cx.recv().is_some() {}
                    report.lock().push(format!(
                        "spawn={}",
                        matches!(cx.spawn("x", "rogue", None), Err(RuntimeError::NotRoot(_)))
                    ));
                    report.lock().push(format!(
                        "hang={}",
                        matches!(cx.hang(ServiceId::ROOT), Err(RuntimeError::NotRoot(_)))
                    ));
                    cx.send(ServiceId::SYSTEM, 0, MessageType::ScheduleNew, None).unwrap();
                    sent = true;
                    return Step::Yield;
                }
                match cx.receipt() {
                    Some(r) => {
                        report.lock().push(format!("schedule-new={}", r.name()));
                        Step::Exit
                    }
                    None => Step::Yield,
                }
            }
        })
    };

    let rt = Arc::new(Runtime::new(config(2), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();
    rt.new_service("rogue", "rogue", Some(rogue), None).unwrap();
    kick(&rt, rogue, 0);

    assert!(run_to_completion(&rt), "runtime did not finish");
    assert_eq!(
        *report.lock(),
        vec!["spawn=true", "hang=true", "schedule-new=error"]
    );
    // Root plus the dead rogue; no slot was handed out.
    assert_eq!(rt.pool().len(), 2);
}

#[test]
fn test_root_spawn_and_bind() {
    let report: Arc<Mutex<Vec<String>>> = Arc::default();
    let engine = {
        let report = report.clone();
        let child_report = report.clone();
        NativeEngine::new()
            .with_program("worker", move || {
                let report = child_report.clone();
                move |cx: &mut ServiceContext<'_>| {
                    while cx.recv().is_some() {}
                    report.lock().push(format!("child-on={:?}", cx.worker_id()));
                    report.lock().push(format!("label={}", cx.label()));
                    Step::Exit
                }
            })
            .with_program("root", move || {
                let report = report.clone();
                let mut child = None;
                move |cx: &mut ServiceContext<'_>| {
                    let Some(id) = child else {
                        report.lock().push(format!("bad-bind={}", cx.bind(Some(99)).is_err()));
                        let id = cx.spawn("spawned", "worker", Some(1)).unwrap();
                        cx.send(id, 1, MessageType::Request, None).unwrap();
                        child = Some(id);
                        return Step::Yield;
                    };
                    while let Some(item) = cx.recv() {
                        if let Inbound::Message(m) = item {
                            if m.from == id && m.kind == MessageType::Signal {
                                return Step::Exit;
                            }
                        }
                    }
                    Step::Yield
                }
            })
    };

    let rt = Arc::new(Runtime::new(config(2), Arc::new(engine)).unwrap());
    rt.new_service("root", "root", Some(ServiceId::ROOT), None).unwrap();

    assert!(run_to_completion(&rt), "runtime did not finish");
    assert_eq!(
        *report.lock(),
        vec!["bad-bind=true", "child-on=Some(1)", "label=spawned"]
    );
}
