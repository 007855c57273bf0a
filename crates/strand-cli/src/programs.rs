//! Built-in service programs for scenarios

use crate::scenario::{label_index, Planned};
use anyhow::{anyhow, bail, Context};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::VecDeque;
use strand::codec;
use strand::{
    Inbound, Message, MessageType, NativeEngine, Program, Receipt, SendError, ServiceContext,
    ServiceId, Session, Step,
};
use tracing::{debug, info, warn};

/// Name and one-line description of every built-in
pub const BUILTINS: &[(&str, &str)] = &[
    ("supervisor", "root: closes finished services, quits after `expect` of them or `deadline` ticks"),
    ("ping", "sends `count` requests to `target`, checking each echo"),
    ("pong", "answers every request with a response carrying the same payload"),
    ("sleeper", "waits `ticks` timer ticks, then quits"),
    ("fail", "faults on its first run with `reason`"),
];

/// Session of the supervisor's deadline timer
const DEADLINE_SESSION: Session = u32::MAX;

fn parse_args<T: DeserializeOwned>(planned: &Planned) -> anyhow::Result<T> {
    toml::Value::Table(planned.spec.args.clone())
        .try_into()
        .with_context(|| format!("bad args for service '{}'", planned.spec.label))
}

/// Register one program instance per planned service
pub fn build_engine(plan: &[Planned]) -> anyhow::Result<NativeEngine> {
    let labels = label_index(plan);
    let mut engine = NativeEngine::new();
    for planned in plan {
        let source = planned.source();
        match planned.spec.program.as_str() {
            "supervisor" => {
                let args: SupervisorArgs = parse_args(planned)?;
                engine.register(source, move || Supervisor::new(&args));
            }
            "ping" => {
                let args: PingArgs = parse_args(planned)?;
                let target = *labels
                    .get(args.target.as_str())
                    .ok_or_else(|| anyhow!("ping '{}': unknown target '{}'", planned.spec.label, args.target))?;
                let count = args.count;
                engine.register(source, move || Ping::new(target, count));
            }
            "pong" => {
                engine.register(source, || Pong);
            }
            "sleeper" => {
                let args: SleeperArgs = parse_args(planned)?;
                engine.register(source, move || Sleeper {
                    ticks: args.ticks,
                    armed: false,
                });
            }
            "fail" => {
                let args: FailArgs = parse_args(planned)?;
                engine.register(source, move || {
                    let reason = args.reason.clone();
                    move |_: &mut ServiceContext<'_>| Step::Fail(reason.clone())
                });
            }
            other => bail!("service '{}': unknown program '{}'", planned.spec.label, other),
        }
    }
    Ok(engine)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SupervisorArgs {
    expect: usize,
    deadline: Option<u64>,
}

/// Root program
struct Supervisor {
    expect: usize,
    deadline: Option<u64>,
    armed: bool,
    finished: usize,
    /// Requests left unanswered by closed services
    owed: VecDeque<(ServiceId, Session)>,
}

impl Supervisor {
    fn new(args: &SupervisorArgs) -> Self {
        Self {
            expect: args.expect,
            deadline: args.deadline,
            armed: false,
            finished: 0,
            owed: VecDeque::new(),
        }
    }

    fn reap(&mut self, cx: &ServiceContext<'_>, id: ServiceId) {
        self.finished += 1;
        match cx.close_service(id) {
            Ok(unanswered) => {
                info!(service = %id, finished = self.finished, "service finished");
                self.owed.extend(unanswered);
            }
            Err(e) => warn!(service = %id, "cannot close: {}", e),
        }
    }
}

impl Program for Supervisor {
    fn step(&mut self, cx: &mut ServiceContext<'_>) -> Step {
        if !self.armed {
            self.armed = true;
            if let Some(ticks) = self.deadline {
                if let Err(e) = cx.timer_add(DEADLINE_SESSION, ticks) {
                    return Step::Fail(e.to_string());
                }
            }
        }
        while let Some(item) = cx.recv() {
            match item {
                Inbound::Message(m) if m.kind == MessageType::Signal => self.reap(cx, m.from),
                Inbound::Message(m) if m.from.is_system() && m.session == DEADLINE_SESSION => {
                    warn!(finished = self.finished, expect = self.expect, "deadline reached");
                    return Step::Exit;
                }
                Inbound::Receipt(Receipt::Block(m)) => self.owed.push_front((m.to, m.session)),
                _ => {}
            }
        }
        if let Some((to, session)) = self.owed.pop_front() {
            if let Err(e) = cx.send(to, session, MessageType::Error, None) {
                let m = e.into_message();
                self.owed.push_front((m.to, m.session));
            }
            return Step::Yield;
        }
        if self.finished >= self.expect {
            info!(finished = self.finished, "all expected services finished");
            return Step::Exit;
        }
        Step::Yield
    }

    fn memory_used(&self) -> usize {
        self.owed.len() * std::mem::size_of::<(ServiceId, Session)>()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PingArgs {
    target: String,
    #[serde(default = "default_count")]
    count: u32,
}

fn default_count() -> u32 {
    100
}

/// Request/response load generator
struct Ping {
    target: ServiceId,
    count: u32,
    sent: u32,
    waiting: bool,
    started: Option<u64>,
}

impl Ping {
    fn new(target: ServiceId, count: u32) -> Self {
        Self {
            target,
            count,
            sent: 0,
            waiting: false,
            started: None,
        }
    }
}

impl Program for Ping {
    fn step(&mut self, cx: &mut ServiceContext<'_>) -> Step {
        let started = *self.started.get_or_insert_with(|| cx.now().1);
        while let Some(item) = cx.recv() {
            match item {
                Inbound::Receipt(Receipt::Block(m)) => {
                    debug!(to = %m.to, session = m.session, "target busy, resending");
                    if let Err(e) = cx.send(m.to, m.session, m.kind, m.payload) {
                        return Step::Fail(e.to_string());
                    }
                }
                Inbound::Receipt(Receipt::Error(_)) => {
                    return Step::Fail(format!("target {} is gone", self.target));
                }
                Inbound::Message(m) if m.from == self.target && m.kind == MessageType::Response => {
                    let echoed = m.payload.as_ref().map(codec::unpack::<u32>);
                    match echoed {
                        Some(Ok(n)) if n == m.session => self.waiting = false,
                        other => {
                            return Step::Fail(format!("bad echo for session {}: {:?}", m.session, other))
                        }
                    }
                }
                _ => {}
            }
        }
        if self.waiting {
            return Step::Yield;
        }
        if self.sent == self.count {
            let (_, now) = cx.now();
            let line = format!(
                "{} round trips to {} in {} ticks, cpu {:?}",
                self.count,
                self.target,
                now - started,
                cx.cpu_cost()
            );
            info!(service = %cx.id(), "{}", line);
            cx.push_log(line.into_bytes());
            return Step::Exit;
        }
        self.sent += 1;
        let payload = match codec::pack(&self.sent) {
            Ok(p) => p,
            Err(e) => return Step::Fail(e.to_string()),
        };
        if let Err(e) = cx.send(self.target, self.sent, MessageType::Request, Some(payload)) {
            return Step::Fail(e.to_string());
        }
        self.waiting = true;
        Step::Yield
    }
}

/// Echo server; works on a worker or in an exclusive thread
struct Pong;

impl Pong {
    fn reply_to(m: Message) -> (ServiceId, Session, Option<strand::Payload>) {
        (m.from, m.session, m.payload)
    }

    fn exclusive_step(cx: &mut ServiceContext<'_>) -> Step {
        match cx.event_wait() {
            Ok(true) => {}
            Ok(false) => return Step::Exit,
            Err(e) => return Step::Fail(e.to_string()),
        }
        while let Some(item) = cx.recv() {
            let Inbound::Message(m) = item else {
                continue;
            };
            if m.kind != MessageType::Request {
                continue;
            }
            let (to, session, payload) = Self::reply_to(m);
            if let Err(SendError::QueueFull(back)) =
                cx.exclusive_send(to, session, MessageType::Response, payload)
            {
                // Flush and retry once; the requester resends if this fails too.
                if cx.scheduling().is_ok() {
                    let _ = cx.exclusive_send(back.to, back.session, back.kind, back.payload);
                }
            }
        }
        Step::Yield
    }
}

impl Program for Pong {
    fn step(&mut self, cx: &mut ServiceContext<'_>) -> Step {
        if cx.is_exclusive(cx.id()) {
            return Self::exclusive_step(cx);
        }
        // One reply per quantum: the outbox holds a single message.
        while let Some(item) = cx.recv() {
            match item {
                Inbound::Receipt(Receipt::Block(m)) => {
                    let _ = cx.send(m.to, m.session, m.kind, m.payload);
                    break;
                }
                Inbound::Message(m) if m.kind == MessageType::Request => {
                    let (to, session, payload) = Self::reply_to(m);
                    if let Err(e) = cx.send(to, session, MessageType::Response, payload) {
                        warn!(service = %cx.id(), "reply dropped: {}", e);
                    }
                    break;
                }
                _ => {}
            }
        }
        Step::Yield
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SleeperArgs {
    ticks: u64,
}

struct Sleeper {
    ticks: u64,
    armed: bool,
}

impl Program for Sleeper {
    fn step(&mut self, cx: &mut ServiceContext<'_>) -> Step {
        if !self.armed {
            self.armed = true;
            if let Err(e) = cx.timer_add(1, self.ticks) {
                return Step::Fail(e.to_string());
            }
        }
        while let Some(item) = cx.recv() {
            if let Inbound::Message(m) = item {
                if m.from.is_system() && m.kind == MessageType::Response {
                    info!(service = %cx.id(), tick = cx.now().1, "woke up");
                    return Step::Exit;
                }
            }
        }
        Step::Yield
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FailArgs {
    reason: String,
}

impl Default for FailArgs {
    fn default() -> Self {
        Self {
            reason: "requested failure".to_string(),
        }
    }
}
