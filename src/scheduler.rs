//! One-shot timer facility used for deferred retries.
//!
//! Machines in asynchronous retry mode need somewhere to say "call me back
//! after duration D". The [`Scheduler`] trait is that contract; it can be
//! injected per machine, and defaults to a process-wide [`TimerWheel`]
//! shared by every machine, lazily constructed on first use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Default tick between wheel advances.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Default number of wheel slots.
pub const DEFAULT_WHEEL_CAPACITY: usize = 1024;

/// Callback registered with a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A facility that runs a callback once after a delay.
pub trait Scheduler: Send + Sync {
    /// Register `task` to run exactly once, no earlier than `delay` from now.
    fn after(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Handle to a pending callback.
///
/// Cancelling turns the callback into a no-op; it has no effect once the
/// callback has started running.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevent the pending callback from running.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

struct Entry {
    rounds: u64,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

struct WheelState {
    cursor: usize,
    slots: Vec<Vec<Entry>>,
}

struct WheelInner {
    tick: Duration,
    state: Mutex<WheelState>,
}

/// Hashed timing wheel driven by a background thread.
///
/// Registration cost is O(1) regardless of the number of pending timers;
/// delays longer than one wheel revolution carry a rounds counter. Entries
/// keep their absolute deadline, so a callback never runs before its delay
/// even when registered partway into a tick; firing resolution is the tick
/// duration. Handles are cheap to clone; the background thread exits once
/// the last handle is dropped.
#[derive(Clone)]
pub struct TimerWheel {
    inner: Arc<WheelInner>,
}

impl TimerWheel {
    /// Create a wheel advancing every `tick` with `capacity` slots.
    ///
    /// A zero tick falls back to [`DEFAULT_TICK`] and a zero capacity to a
    /// single slot.
    pub fn new(tick: Duration, capacity: usize) -> Self {
        let tick = if tick.is_zero() { DEFAULT_TICK } else { tick };
        let capacity = capacity.max(1);
        let inner = Arc::new(WheelInner {
            tick,
            state: Mutex::new(WheelState {
                cursor: 0,
                slots: (0..capacity).map(|_| Vec::new()).collect(),
            }),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("fsm-timer-wheel".into())
            .spawn(move || run_wheel(weak))
            .expect("failed to spawn timer wheel thread");

        Self { inner }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new(DEFAULT_TICK, DEFAULT_WHEEL_CAPACITY)
    }
}

impl Scheduler for TimerWheel {
    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + delay;
        let ticks = ticks_until(delay, self.inner.tick);

        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = state.slots.len() as u64;
        let slot = ((state.cursor as u64 + ticks) % capacity) as usize;
        let rounds = (ticks - 1) / capacity;
        state.slots[slot].push(Entry {
            rounds,
            deadline,
            cancelled: Arc::clone(&cancelled),
            task,
        });
        trace!(delay_ms = delay.as_millis() as u64, slot, rounds, "timer registered");

        TimerHandle { cancelled }
    }
}

/// Whole ticks spanning `remaining`, never less than one.
fn ticks_until(remaining: Duration, tick: Duration) -> u64 {
    remaining
        .as_nanos()
        .div_ceil(tick.as_nanos().max(1))
        .max(1) as u64
}

fn run_wheel(inner: Weak<WheelInner>) {
    debug!("timer wheel thread started");
    loop {
        let tick = match inner.upgrade() {
            Some(wheel) => wheel.tick,
            None => break,
        };
        thread::sleep(tick);

        let Some(wheel) = inner.upgrade() else { break };
        let due = {
            let mut state = wheel.state.lock().unwrap_or_else(|e| e.into_inner());
            let capacity = state.slots.len();
            let cursor = (state.cursor + 1) % capacity;
            state.cursor = cursor;

            let drained: Vec<Entry> = state.slots[cursor].drain(..).collect();
            let now = Instant::now();
            let mut due = Vec::new();
            for mut entry in drained {
                if entry.cancelled.load(Ordering::Relaxed) {
                    continue;
                }
                if entry.rounds > 0 {
                    entry.rounds -= 1;
                    state.slots[cursor].push(entry);
                } else if entry.deadline <= now {
                    due.push(entry.task);
                } else {
                    // Registered mid-tick: its slot came up before the
                    // deadline. Park it again for the remaining time so it
                    // never fires early.
                    let ticks = ticks_until(entry.deadline - now, wheel.tick);
                    let slot = ((cursor as u64 + ticks) % capacity as u64) as usize;
                    entry.rounds = (ticks - 1) / capacity as u64;
                    state.slots[slot].push(entry);
                }
            }
            due
        };

        for task in due {
            task();
        }
    }
    debug!("timer wheel thread stopped");
}

/// The process-wide shared wheel, lazily constructed under a global lock.
///
/// The first caller's `tick` and `capacity` fix the wheel's parameters;
/// later callers receive the same instance regardless of their arguments.
pub fn shared(tick: Duration, capacity: usize) -> TimerWheel {
    static SHARED: OnceLock<TimerWheel> = OnceLock::new();
    SHARED.get_or_init(|| TimerWheel::new(tick, capacity)).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until(fired: &Arc<Mutex<Option<Duration>>>, limit: Duration) -> Option<Duration> {
        let start = Instant::now();
        while start.elapsed() < limit {
            if let Some(elapsed) = *fired.lock().unwrap() {
                return Some(elapsed);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    fn recording_task(fired: &Arc<Mutex<Option<Duration>>>, start: Instant) -> Task {
        let fired = Arc::clone(fired);
        Box::new(move || {
            *fired.lock().unwrap() = Some(start.elapsed());
        })
    }

    #[test]
    fn fires_no_earlier_than_the_delay() {
        let wheel = TimerWheel::new(Duration::from_millis(5), 64);
        let fired = Arc::new(Mutex::new(None));
        let start = Instant::now();
        wheel.after(Duration::from_millis(25), recording_task(&fired, start));

        let elapsed = wait_until(&fired, Duration::from_secs(2)).expect("timer never fired");
        assert!(elapsed >= Duration::from_millis(25), "fired early: {elapsed:?}");
    }

    #[test]
    fn mid_tick_registration_does_not_fire_early() {
        let wheel = TimerWheel::new(Duration::from_millis(200), 8);
        // Land partway into the wheel's current tick before registering, so
        // the next slot visit arrives well before the deadline.
        thread::sleep(Duration::from_millis(150));

        let fired = Arc::new(Mutex::new(None));
        let start = Instant::now();
        wheel.after(Duration::from_millis(200), recording_task(&fired, start));

        let elapsed = wait_until(&fired, Duration::from_secs(3)).expect("timer never fired");
        assert!(elapsed >= Duration::from_millis(200), "fired early: {elapsed:?}");
    }

    #[test]
    fn cancelled_handle_never_fires() {
        let wheel = TimerWheel::new(Duration::from_millis(5), 64);
        let fired = Arc::new(Mutex::new(None));
        let handle = wheel.after(Duration::from_millis(20), recording_task(&fired, Instant::now()));
        handle.cancel();
        assert!(handle.is_cancelled());

        thread::sleep(Duration::from_millis(150));
        assert!(fired.lock().unwrap().is_none());
    }

    #[test]
    fn delay_longer_than_one_revolution() {
        // 4 slots * 5ms tick = one 20ms revolution; 60ms needs extra rounds.
        let wheel = TimerWheel::new(Duration::from_millis(5), 4);
        let fired = Arc::new(Mutex::new(None));
        let start = Instant::now();
        wheel.after(Duration::from_millis(60), recording_task(&fired, start));

        let elapsed = wait_until(&fired, Duration::from_secs(2)).expect("timer never fired");
        assert!(elapsed >= Duration::from_millis(60), "fired early: {elapsed:?}");
    }

    #[test]
    fn shared_wheel_is_a_singleton() {
        let a = shared(Duration::from_millis(50), 16);
        let b = shared(Duration::from_millis(999), 1);
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}
