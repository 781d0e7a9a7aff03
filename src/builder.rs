//! Builder applying ordered configuration effects to a fresh machine.
//!
//! Each chained call is one configuration effect; effects apply in call
//! order and later effects targeting the same key overwrite earlier ones
//! (last-write-wins, no conflict detection).

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Cause;
use crate::event::{Event, Hook, HookKey, Outcome, Phase};
use crate::fsm::{ErrorHandler, Inner, Machine};
use crate::scheduler::{Scheduler, DEFAULT_TICK, DEFAULT_WHEEL_CAPACITY};

/// Builder for [`Machine`], created via [`Machine::builder`].
pub struct MachineBuilder<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    initial: T,
    transitions: HashMap<T, T>,
    hooks: HashMap<HookKey<T>, Hook<T>>,
    handler: Option<ErrorHandler<T>>,
    async_retry: bool,
    retry_tick: Duration,
    wheel_capacity: usize,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl<T> MachineBuilder<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub(crate) fn new(initial: T) -> Self {
        Self {
            initial,
            transitions: HashMap::new(),
            hooks: HashMap::new(),
            handler: None,
            async_retry: false,
            retry_tick: DEFAULT_TICK,
            wheel_capacity: DEFAULT_WHEEL_CAPACITY,
            scheduler: None,
        }
    }

    /// Declare the destination reached from `src` when no hook interrupts.
    ///
    /// At most one destination per source; registering `src` again replaces
    /// the previous destination.
    pub fn transition(mut self, src: T, dest: T) -> Self {
        self.transitions.insert(src, dest);
        self
    }

    /// Register the hook run before entering `state`.
    pub fn on_before<F, Fut>(self, state: T, hook: F) -> Self
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.hook(Phase::Before, state, hook)
    }

    /// Register the hook run upon entering `state`.
    pub fn on_enter<F, Fut>(self, state: T, hook: F) -> Self
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.hook(Phase::Enter, state, hook)
    }

    /// Register the hook run after `state` settles.
    pub fn on_after<F, Fut>(self, state: T, hook: F) -> Self
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.hook(Phase::After, state, hook)
    }

    fn hook<F, Fut>(mut self, phase: Phase, state: T, hook: F) -> Self
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.hooks.insert(
            HookKey { phase, state },
            Box::new(move |event| Box::pin(hook(event))),
        );
        self
    }

    /// Receive every interruption as `(final_state, cause)`.
    ///
    /// Without a handler, outcomes are silently dropped.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(T, Cause<T>) + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Enable asynchronous retry mode: a hook's retry returns immediately
    /// and the chain is re-entered by a timer callback.
    pub fn async_retry(mut self) -> Self {
        self.async_retry = true;
        self
    }

    /// Tick duration for the timer wheel backing deferred retries.
    ///
    /// Only consulted when this machine is the one forcing construction of
    /// the shared wheel; an injected [`scheduler`](Self::scheduler) ignores
    /// it.
    pub fn retry_tick(mut self, tick: Duration) -> Self {
        self.retry_tick = tick;
        self
    }

    /// Slot count for the timer wheel backing deferred retries.
    ///
    /// Same scope as [`retry_tick`](Self::retry_tick).
    pub fn wheel_capacity(mut self, capacity: usize) -> Self {
        self.wheel_capacity = capacity;
        self
    }

    /// Use `scheduler` for deferred retries instead of the process-wide
    /// shared timer wheel.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Assemble the machine. Configuration is immutable afterwards except
    /// for the current state.
    pub fn build(self) -> Machine<T> {
        Machine {
            inner: Arc::new(Inner {
                state: Mutex::new(self.initial),
                drive_mu: tokio::sync::Mutex::new(()),
                transitions: self.transitions,
                hooks: self.hooks,
                handler: self.handler,
                async_retry: self.async_retry,
                retry_tick: self.retry_tick,
                wheel_capacity: self.wheel_capacity,
                scheduler: self.scheduler,
            }),
        }
    }
}
