//! Hierarchical timing wheel
//!
//! A near wheel of 256 slots plus four levels of 64 slots each. Every tick
//! fires the due near slot, advances time, cascades the next coarser slot
//! when a boundary is crossed, then fires again. Timers added with a delay
//! of zero fire on the next tick.
//!
//! [`Timer`] wraps the wheel with a monotonic clock; the scheduler drains
//! due events into `Response` messages during each dispatch pass.

use crate::message::{ServiceId, Session};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const NEAR_SHIFT: u32 = 8;
const NEAR: usize = 1 << NEAR_SHIFT;
const NEAR_MASK: u32 = (NEAR as u32) - 1;
const LEVEL_SHIFT: u32 = 6;
const LEVEL: usize = 1 << LEVEL_SHIFT;
const LEVEL_MASK: u32 = (LEVEL as u32) - 1;
const LEVELS: usize = 4;

struct Node<T> {
    expire: u32,
    value: T,
}

/// The bare wheel, generic over the payload
pub struct TimingWheel<T> {
    near: Vec<Vec<Node<T>>>,
    levels: Vec<Vec<Vec<Node<T>>>>,
    time: u32,
    len: usize,
}

impl<T> Default for TimingWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimingWheel<T> {
    /// Empty wheel at time 0
    pub fn new() -> Self {
        Self {
            near: (0..NEAR).map(|_| Vec::new()).collect(),
            levels: (0..LEVELS)
                .map(|_| (0..LEVEL).map(|_| Vec::new()).collect())
                .collect(),
            time: 0,
            len: 0,
        }
    }

    /// Wheel time in ticks (wraps at 2^32)
    pub fn time(&self) -> u32 {
        self.time
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is armed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Arm `value` to fire `ticks` ticks from now
    pub fn add(&mut self, value: T, ticks: u32) {
        let expire = self.time.wrapping_add(ticks);
        self.len += 1;
        self.add_node(Node { expire, value });
    }

    fn add_node(&mut self, node: Node<T>) {
        let time = node.expire;
        let current = self.time;
        if (time | NEAR_MASK) == (current | NEAR_MASK) {
            self.near[(time & NEAR_MASK) as usize].push(node);
            return;
        }
        // u64 so the top level's mask does not overflow
        let mut mask: u64 = (NEAR as u64) << LEVEL_SHIFT;
        let mut level = 0;
        while level < LEVELS - 1 {
            let low = (mask - 1) as u32;
            if (time | low) == (current | low) {
                break;
            }
            mask <<= LEVEL_SHIFT;
            level += 1;
        }
        let shift = NEAR_SHIFT + level as u32 * LEVEL_SHIFT;
        let idx = ((time >> shift) & LEVEL_MASK) as usize;
        self.levels[level][idx].push(node);
    }

    fn move_list(&mut self, level: usize, idx: usize) {
        let nodes = std::mem::take(&mut self.levels[level][idx]);
        for node in nodes {
            self.add_node(node);
        }
    }

    fn shift(&mut self) {
        self.time = self.time.wrapping_add(1);
        let ct = self.time;
        if ct == 0 {
            self.move_list(LEVELS - 1, 0);
            return;
        }
        let mut mask: u64 = NEAR as u64;
        let mut time = ct >> NEAR_SHIFT;
        let mut level = 0;
        while (ct as u64 & (mask - 1)) == 0 && level < LEVELS {
            let idx = (time & LEVEL_MASK) as usize;
            if idx != 0 {
                self.move_list(level, idx);
                break;
            }
            mask <<= LEVEL_SHIFT;
            time >>= LEVEL_SHIFT;
            level += 1;
        }
    }

    fn execute(&mut self, fired: &mut impl FnMut(T)) {
        let idx = (self.time & NEAR_MASK) as usize;
        while !self.near[idx].is_empty() {
            let nodes = std::mem::take(&mut self.near[idx]);
            self.len -= nodes.len();
            for node in nodes {
                fired(node.value);
            }
        }
    }

    /// Advance one tick, handing every due value to `fired` in arming order
    pub fn tick(&mut self, mut fired: impl FnMut(T)) {
        self.execute(&mut fired);
        self.shift();
        self.execute(&mut fired);
    }
}

/// A due timer: deliver a `Response` with `session` to `service`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Target service
    pub service: ServiceId,
    /// Session echoed back in the response
    pub session: Session,
}

struct Clock {
    wheel: TimingWheel<TimerEvent>,
    /// Monotonic tick the wheel has been advanced to
    point: u64,
    /// Fired while catching up outside a pass; handed out by the next update
    overdue: Vec<TimerEvent>,
}

/// Wheel plus clock, shared by all runtime threads
pub struct Timer {
    clock: Mutex<Clock>,
    origin: Instant,
    tick: Duration,
    /// Wall-clock seconds when the runtime started
    start_secs: u64,
    pending: AtomicUsize,
    stopped: AtomicBool,
    park: Mutex<()>,
    notify: Condvar,
}

impl Timer {
    /// Create a timer with the given resolution
    pub fn new(tick: Duration) -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            clock: Mutex::new(Clock {
                wheel: TimingWheel::new(),
                point: 0,
                overdue: Vec::new(),
            }),
            origin: Instant::now(),
            tick,
            start_secs: wall.as_secs(),
            pending: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            park: Mutex::new(()),
            notify: Condvar::new(),
        }
    }

    /// Length of one tick
    pub fn resolution(&self) -> Duration {
        self.tick
    }

    /// Arm a timer for `service`, `ticks` from the current clock tick
    pub fn add(&self, service: ServiceId, session: Session, ticks: u32) {
        let point = self.monotonic_ticks();
        let mut clock = self.clock.lock();
        // The wheel only moves during passes; bring it to the clock first
        // so the delay counts from now.
        Self::catch_up(&mut clock, point);
        clock.wheel.add(TimerEvent { service, session }, ticks);
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Ticks elapsed since start
    pub fn now(&self) -> u64 {
        self.monotonic_ticks()
    }

    /// Wall-clock second at which the runtime started
    pub fn start_time(&self) -> u64 {
        self.start_secs
    }

    /// Armed timers not yet handed out
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn monotonic_ticks(&self) -> u64 {
        let tick = self.tick.as_nanos().max(1);
        (self.origin.elapsed().as_nanos() / tick) as u64
    }

    fn catch_up(clock: &mut Clock, point: u64) {
        if point <= clock.point {
            return;
        }
        let Clock {
            wheel,
            point: at,
            overdue,
        } = clock;
        for _ in *at..point {
            wheel.tick(|ev| overdue.push(ev));
        }
        *at = point;
    }

    /// Catch the wheel up with the clock, collecting due events
    pub fn update(&self, due: &mut Vec<TimerEvent>) {
        let point = self.monotonic_ticks();
        let mut clock = self.clock.lock();
        Self::catch_up(&mut clock, point);
        let fired = clock.overdue.len();
        if fired > 0 {
            due.append(&mut clock.overdue);
            self.pending.fetch_sub(fired, Ordering::AcqRel);
        }
    }

    /// Sleep one tick, or less if [`stop`](Self::stop) is called.
    /// Returns false once stopped.
    pub fn sleep_tick(&self) -> bool {
        let mut guard = self.park.lock();
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.notify.wait_for(&mut guard, self.tick);
        !self.stopped.load(Ordering::Acquire)
    }

    /// Release the ticker thread
    pub fn stop(&self) {
        let _guard = self.park.lock();
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_all();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .field("tick", &self.tick)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run(wheel: &mut TimingWheel<u32>, ticks: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for t in 1..=ticks {
            wheel.tick(|v| out.push((t, v)));
        }
        out
    }

    #[test]
    fn test_near_timer_fires_on_time() {
        let mut wheel = TimingWheel::new();
        wheel.add(7, 5);
        assert_eq!(wheel.len(), 1);
        let fired = run(&mut wheel, 10);
        assert_eq!(fired, vec![(5, 7)]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_zero_delay_fires_next_tick() {
        let mut wheel = TimingWheel::new();
        wheel.add(1, 0);
        let fired = run(&mut wheel, 1);
        assert_eq!(fired, vec![(1, 1)]);
    }

    #[test]
    fn test_cascade_from_levels() {
        let mut wheel = TimingWheel::new();
        wheel.add(1, 300);
        wheel.add(2, 256 * 64 + 3);
        wheel.add(3, 255);
        let fired = run(&mut wheel, 256 * 64 + 10);
        assert_eq!(fired, vec![(255, 3), (300, 1), (256 * 64 + 3, 2)]);
    }

    #[test]
    fn test_same_tick_keeps_arming_order() {
        let mut wheel = TimingWheel::new();
        for v in 0..5 {
            wheel.add(v, 1000);
        }
        let fired: Vec<u32> = run(&mut wheel, 1000).into_iter().map(|(_, v)| v).collect();
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_timer_update_counts_pending() {
        let timer = Timer::new(Duration::from_millis(1));
        timer.add(ServiceId::new(3), 9, 2);
        timer.add(ServiceId::new(4), 1, 1_000_000);
        assert_eq!(timer.pending(), 2);

        thread::sleep(Duration::from_millis(20));
        let mut due = Vec::new();
        timer.update(&mut due);
        assert_eq!(
            due,
            vec![TimerEvent {
                service: ServiceId::new(3),
                session: 9
            }]
        );
        assert_eq!(timer.pending(), 1);
    }

    #[test]
    fn test_timer_armed_after_idle_stretch_counts_from_now() {
        let timer = Timer::new(Duration::from_millis(10));
        // No update runs while the clock moves on.
        thread::sleep(Duration::from_millis(60));
        assert!(timer.now() >= 6, "now = {}", timer.now());

        let armed = Instant::now();
        timer.add(ServiceId::new(3), 7, 20);
        let mut due = Vec::new();
        timer.update(&mut due);
        assert!(due.is_empty(), "fired at once after {:?}", armed.elapsed());
        assert_eq!(timer.pending(), 1);

        while due.is_empty() {
            thread::sleep(Duration::from_millis(5));
            timer.update(&mut due);
        }
        assert!(armed.elapsed() >= Duration::from_millis(190), "fired after {:?}", armed.elapsed());
        assert_eq!(due[0].session, 7);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_catch_up_in_add_keeps_due_events() {
        let timer = Timer::new(Duration::from_millis(1));
        timer.add(ServiceId::new(3), 1, 1);
        thread::sleep(Duration::from_millis(10));
        // This catch-up fires the first timer; it must survive to the update.
        timer.add(ServiceId::new(4), 2, 1_000_000);
        let mut due = Vec::new();
        timer.update(&mut due);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].service, ServiceId::new(3));
        assert_eq!(timer.pending(), 1);
    }

    #[test]
    fn test_stop_releases_sleeper() {
        let timer = Timer::new(Duration::from_secs(60));
        timer.stop();
        assert!(!timer.sleep_tick());
    }
}
