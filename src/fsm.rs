//! The transition engine.
//!
//! A [`Machine`] walks a chain of states: for each state it runs the
//! registered [`Phase::Before`], [`Phase::Enter`] and [`Phase::After`] hooks
//! in order, then follows the transition table to the next state, until it
//! reaches a state with no declared transition. Hooks steer the engine
//! through their returned [`Outcome`]: they can cancel the chain, fail it,
//! or ask for a deferred retry of the current state.
//!
//! # Concurrency
//!
//! One drive mutex per machine wraps each top-level [`Machine::drive`] call
//! end-to-end, including synchronous retries, so concurrent drives on the
//! same machine never interleave their hook executions. The state accessor
//! ([`Machine::state`] / [`Machine::set_state`]) uses its own finer lock and
//! is never blocked by an in-flight chain.
//!
//! An asynchronous retry releases the drive mutex when the original call
//! returns; the timer continuation re-acquires it before re-entering the
//! chain, but it is a new critical section — a drive that runs in between
//! observes the intermediate state.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::builder::MachineBuilder;
use crate::error::Cause;
use crate::event::{Arg, Event, Hook, HookKey, Outcome, Phase};
use crate::scheduler::{self, Scheduler};

/// Host-supplied sink for chain outcomes.
pub(crate) type ErrorHandler<T> = Box<dyn Fn(T, Cause<T>) + Send + Sync>;

pub(crate) struct Inner<T: Debug> {
    pub(crate) state: Mutex<T>,
    pub(crate) drive_mu: tokio::sync::Mutex<()>,
    pub(crate) transitions: HashMap<T, T>,
    pub(crate) hooks: HashMap<HookKey<T>, Hook<T>>,
    pub(crate) handler: Option<ErrorHandler<T>>,
    pub(crate) async_retry: bool,
    pub(crate) retry_tick: Duration,
    pub(crate) wheel_capacity: usize,
    pub(crate) scheduler: Option<Arc<dyn Scheduler>>,
}

/// A finite state machine with automatic transition chaining.
///
/// `Machine` is a cheap-clone handle; clones drive the same underlying
/// machine. The state label type `T` is chosen by the host and only needs
/// value equality and hashing — states never referenced in the transition
/// table or hook registry are legal, the chain simply terminates there.
///
/// Outcomes never surface through return values: [`Machine::drive`] is
/// fire-and-forget and every interruption funnels through the error handler
/// configured at build time (or is silently dropped without one).
///
/// ```
/// use async_chained_fsm::{CancellationToken, Machine, Outcome};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let machine = Machine::builder("draft")
///     .transition("draft", "review")
///     .transition("review", "published")
///     .on_enter("published", |event| async move {
///         println!("published with {} args", event.args().len());
///         Outcome::Continue
///     })
///     .build();
///
/// machine.drive(CancellationToken::new(), Vec::new()).await;
/// assert_eq!(machine.state(), "published");
/// # }
/// ```
pub struct Machine<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Clone for Machine<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Machine<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Start building a machine with the given initial state.
    pub fn builder(initial: T) -> MachineBuilder<T> {
        MachineBuilder::new(initial)
    }

    /// The current state, read under the state lock.
    pub fn state(&self) -> T {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Overwrite the current state under the state lock.
    ///
    /// Intended for administrative overrides by the host; the engine routes
    /// its own transitions through the same lock. Returns `&self` for
    /// chaining.
    pub fn set_state(&self, state: T) -> &Self {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        self
    }

    /// Drive the machine forward from the current state.
    ///
    /// Runs the three-phase hook chain for the current state, follows the
    /// transition table and repeats until a terminal state is reached or a
    /// hook interrupts the chain. The call is serialized against other
    /// drives on the same machine and returns no value; interruptions are
    /// reported through the configured error handler.
    ///
    /// The token is checked once per step boundary, never mid-hook. `args`
    /// are shared read-only with every hook in the chain, including deferred
    /// retry continuations.
    pub async fn drive(&self, token: CancellationToken, args: Vec<Arg>) {
        let args = Arc::new(args);
        let _guard = self.inner.drive_mu.lock().await;
        self.chain(&token, &args).await;
    }

    async fn chain(&self, token: &CancellationToken, args: &Arc<Vec<Arg>>) {
        loop {
            let state = self.state();
            if token.is_cancelled() {
                debug!(state = ?state, "drive interrupted by cancellation token");
                self.report(state.clone(), Cause::Interrupted(state));
                return;
            }

            let mut outcome = Outcome::Continue;
            for phase in Phase::ALL {
                // State is re-read per phase: a hook may have force-set it
                // through a machine handle.
                let current = self.state();
                let key = HookKey {
                    phase,
                    state: current.clone(),
                };
                let Some(hook) = self.inner.hooks.get(&key) else {
                    continue;
                };
                trace!(state = ?current, ?phase, "running hook");
                outcome = hook(Event::new(current, token.clone(), Arc::clone(args))).await;
                if !matches!(outcome, Outcome::Continue) {
                    break;
                }
            }

            match outcome {
                Outcome::Continue => {}
                Outcome::Retry(delay) => {
                    let state = self.state();
                    if !self.inner.async_retry {
                        debug!(state = ?state, delay_ms = delay.as_millis() as u64, "retrying in place");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    debug!(state = ?state, delay_ms = delay.as_millis() as u64, "scheduling deferred retry");
                    self.report(state.clone(), Cause::Retry(state));
                    self.schedule_retry(delay, token.clone(), Arc::clone(args));
                    return;
                }
                Outcome::Cancel => {
                    let state = self.state();
                    debug!(state = ?state, "chain canceled by hook");
                    self.report(state.clone(), Cause::Canceled(state));
                    return;
                }
                Outcome::Fail(err) => {
                    let state = self.state();
                    debug!(state = ?state, error = %err, "hook failed");
                    self.report(state, Cause::Hook(err));
                    return;
                }
            }

            let current = self.state();
            let Some(dest) = self.inner.transitions.get(&current) else {
                trace!(state = ?current, "terminal state reached");
                return;
            };
            trace!(from = ?current, to = ?dest, "advancing");
            self.set_state(dest.clone());
        }
    }

    /// Register a one-shot continuation that re-enters the chain after
    /// `delay`. The continuation re-acquires the drive mutex.
    fn schedule_retry(&self, delay: Duration, token: CancellationToken, args: Arc<Vec<Arg>>) {
        let machine = self.clone();
        let rt = tokio::runtime::Handle::current();
        self.scheduler().after(
            delay,
            Box::new(move || {
                rt.spawn(async move {
                    let _guard = machine.inner.drive_mu.lock().await;
                    machine.chain(&token, &args).await;
                });
            }),
        );
    }

    fn scheduler(&self) -> Arc<dyn Scheduler> {
        match &self.inner.scheduler {
            Some(scheduler) => Arc::clone(scheduler),
            None => Arc::new(scheduler::shared(
                self.inner.retry_tick,
                self.inner.wheel_capacity,
            )),
        }
    }

    fn report(&self, state: T, cause: Cause<T>) {
        let Some(handler) = &self.inner.handler else {
            return;
        };
        debug!(state = ?state, cause = %cause, "reporting to handler");
        handler(state, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::ready;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Step {
        A,
        B,
        C,
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;
    type Causes = Arc<Mutex<Vec<(Step, Cause<Step>)>>>;

    fn mark(log: &Log, name: &'static str) -> impl Fn(Event<Step>) -> std::future::Ready<Outcome> {
        let log = Arc::clone(log);
        move |_| {
            log.lock().unwrap().push(name);
            ready(Outcome::Continue)
        }
    }

    fn collect(causes: &Causes) -> impl Fn(Step, Cause<Step>) {
        let causes = Arc::clone(causes);
        move |state, cause| causes.lock().unwrap().push((state, cause))
    }

    #[tokio::test]
    async fn terminal_state_stops_silently() {
        let causes: Causes = Arc::new(Mutex::new(Vec::new()));
        let machine = Machine::builder(Step::A)
            .error_handler(collect(&causes))
            .build();

        machine.drive(CancellationToken::new(), Vec::new()).await;

        assert_eq!(machine.state(), Step::A);
        assert!(causes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn precancelled_token_interrupts_before_any_hook() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let causes: Causes = Arc::new(Mutex::new(Vec::new()));
        let machine = Machine::builder(Step::A)
            .transition(Step::A, Step::B)
            .on_enter(Step::A, mark(&log, "A"))
            .error_handler(collect(&causes))
            .build();

        let token = CancellationToken::new();
        token.cancel();
        machine.drive(token, Vec::new()).await;

        assert!(log.lock().unwrap().is_empty());
        let causes = causes.lock().unwrap();
        assert_eq!(causes.len(), 1);
        assert_eq!(causes[0].0, Step::A);
        assert!(matches!(causes[0].1, Cause::Interrupted(Step::A)));
        assert_eq!(machine.state(), Step::A);
    }

    #[tokio::test]
    async fn before_hook_short_circuits_remaining_phases() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let causes: Causes = Arc::new(Mutex::new(Vec::new()));
        let machine = Machine::builder(Step::A)
            .transition(Step::A, Step::B)
            .on_before(Step::A, |_| ready(Outcome::Cancel))
            .on_enter(Step::A, mark(&log, "enter"))
            .on_after(Step::A, mark(&log, "after"))
            .error_handler(collect(&causes))
            .build();

        machine.drive(CancellationToken::new(), Vec::new()).await;

        assert!(log.lock().unwrap().is_empty());
        let causes = causes.lock().unwrap();
        assert_eq!(causes.len(), 1);
        assert!(matches!(causes[0].1, Cause::Canceled(Step::A)));
        // No transition out of the canceled state.
        assert_eq!(machine.state(), Step::A);
    }

    #[tokio::test]
    async fn failing_hook_reports_verbatim() {
        let causes: Causes = Arc::new(Mutex::new(Vec::new()));
        let machine = Machine::builder(Step::A)
            .transition(Step::A, Step::B)
            .on_enter(Step::A, |_| ready(Outcome::fail("disk on fire")))
            .error_handler(collect(&causes))
            .build();

        machine.drive(CancellationToken::new(), Vec::new()).await;

        let causes = causes.lock().unwrap();
        assert_eq!(causes.len(), 1);
        match &causes[0].1 {
            Cause::Hook(err) => assert_eq!(err.to_string(), "disk on fire"),
            other => panic!("unexpected cause: {other}"),
        }
        assert_eq!(machine.state(), Step::A);
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let machine = Machine::builder(Step::A)
            .transition(Step::A, Step::B)
            .transition(Step::A, Step::C)
            .on_enter(Step::A, mark(&log, "first"))
            .on_enter(Step::A, mark(&log, "second"))
            .on_enter(Step::B, mark(&log, "B"))
            .on_enter(Step::C, mark(&log, "C"))
            .build();

        machine.drive(CancellationToken::new(), Vec::new()).await;

        // Both the duplicate transition and the duplicate hook were replaced.
        assert_eq!(machine.state(), Step::C);
        assert_eq!(*log.lock().unwrap(), vec!["second", "C"]);
    }

    #[tokio::test]
    async fn hooks_read_caller_args() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let machine = Machine::builder(Step::A)
            .on_enter(Step::A, move |event| {
                let seen = Arc::clone(&seen2);
                async move {
                    *seen.lock().unwrap() = event.arg::<String>(0).cloned();
                    Outcome::Continue
                }
            })
            .build();

        let args: Vec<Arg> = vec![Box::new(String::from("payload"))];
        machine.drive(CancellationToken::new(), args).await;

        assert_eq!(seen.lock().unwrap().as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn sync_retry_reruns_the_full_step() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = Arc::clone(&attempts);
        let machine = Machine::builder(Step::A)
            .transition(Step::A, Step::B)
            .on_before(Step::A, mark(&log, "before"))
            .on_enter(Step::A, move |_| {
                let n = attempts2.fetch_add(1, Ordering::SeqCst);
                ready(if n == 0 {
                    Outcome::Retry(Duration::from_millis(1))
                } else {
                    Outcome::Continue
                })
            })
            .build();

        machine.drive(CancellationToken::new(), Vec::new()).await;

        // The before hook runs again on the retried step.
        assert_eq!(*log.lock().unwrap(), vec!["before", "before"]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(machine.state(), Step::B);
    }

    #[test]
    fn set_state_round_trips() {
        let machine = Machine::builder(Step::A).build();
        assert_eq!(machine.set_state(Step::C).state(), Step::C);
        assert_eq!(machine.set_state(Step::B).state(), Step::B);
    }

    #[tokio::test]
    async fn missing_handler_drops_outcomes() {
        let machine = Machine::builder(Step::A)
            .on_enter(Step::A, |_| ready(Outcome::Cancel))
            .build();

        // Nothing to observe; the drive simply must not panic.
        machine.drive(CancellationToken::new(), Vec::new()).await;
        assert_eq!(machine.state(), Step::A);
    }
}
