//! Gated trigger mode: explicit targets behind an allow-list.
//!
//! [`GatedMachine`] is the strictly simpler sibling of [`Machine`]: there is
//! no transition table, no automatic chaining, no after phase and no
//! retry/cancel mechanism. The caller names the target state; the machine
//! checks it against the current state's allow-list, runs the target's
//! *before* and *trigger* callbacks and commits the new state, or returns an
//! error without touching anything.
//!
//! [`Machine`]: crate::Machine

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TriggerError;
use crate::event::{Arg, Event};

/// Boxed future returned by a gated-mode callback.
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type Callback<T> = Box<dyn Fn(Event<T>) -> CallbackFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CallbackPhase {
    Before,
    Trigger,
}

struct GatedInner<T> {
    state: Mutex<T>,
    trigger_mu: tokio::sync::Mutex<()>,
    allowed: HashMap<T, HashSet<T>>,
    callbacks: HashMap<(CallbackPhase, T), Callback<T>>,
}

/// A state machine whose transitions are requested explicitly and gated by
/// an allow-list.
///
/// Cheap-clone handle like [`Machine`](crate::Machine). Triggers on the same
/// machine are serialized.
pub struct GatedMachine<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    inner: Arc<GatedInner<T>>,
}

impl<T> Clone for GatedMachine<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> GatedMachine<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Start building a gated machine with the given initial state.
    pub fn builder(initial: T) -> GatedBuilder<T> {
        GatedBuilder::new(initial)
    }

    /// The current state, read under the state lock.
    pub fn state(&self) -> T {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Overwrite the current state. Returns `&self` for chaining.
    pub fn set_state(&self, state: T) -> &Self {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        self
    }

    /// Request a transition to `target`.
    ///
    /// Fails with [`TriggerError::NotAllowed`] when `target` is not in the
    /// current state's allow-list, and with [`TriggerError::Interrupted`]
    /// when the token is already cancelled; in both cases no callback runs
    /// and the state is untouched. Otherwise runs `target`'s *before* then
    /// *trigger* callbacks and commits `target` as the new state.
    pub async fn trigger(
        &self,
        token: CancellationToken,
        target: T,
        args: Vec<Arg>,
    ) -> Result<(), TriggerError<T>> {
        let _guard = self.inner.trigger_mu.lock().await;

        let current = self.state();
        if token.is_cancelled() {
            debug!(state = ?current, "trigger interrupted by cancellation token");
            return Err(TriggerError::Interrupted(current));
        }
        let allowed = self
            .inner
            .allowed
            .get(&current)
            .is_some_and(|dests| dests.contains(&target));
        if !allowed {
            debug!(from = ?current, to = ?target, "trigger rejected by allow-list");
            return Err(TriggerError::NotAllowed {
                from: current,
                to: target,
            });
        }

        let args = Arc::new(args);
        for phase in [CallbackPhase::Before, CallbackPhase::Trigger] {
            if let Some(callback) = self.inner.callbacks.get(&(phase, target.clone())) {
                trace!(state = ?target, ?phase, "running callback");
                callback(Event::new(target.clone(), token.clone(), Arc::clone(&args))).await;
            }
        }

        trace!(from = ?current, to = ?target, "trigger committed");
        self.set_state(target);
        Ok(())
    }
}

/// Builder for [`GatedMachine`], created via [`GatedMachine::builder`].
pub struct GatedBuilder<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    initial: T,
    allowed: HashMap<T, HashSet<T>>,
    callbacks: HashMap<(CallbackPhase, T), Callback<T>>,
}

impl<T> GatedBuilder<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn new(initial: T) -> Self {
        Self {
            initial,
            allowed: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Allow triggering `to` while the machine is in `from`.
    pub fn allow(mut self, from: T, to: T) -> Self {
        self.allowed.entry(from).or_default().insert(to);
        self
    }

    /// Register the callback run before `state` is triggered.
    pub fn on_before<F, Fut>(self, state: T, callback: F) -> Self
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callback(CallbackPhase::Before, state, callback)
    }

    /// Register the callback run when `state` is triggered.
    pub fn on_trigger<F, Fut>(self, state: T, callback: F) -> Self
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callback(CallbackPhase::Trigger, state, callback)
    }

    fn callback<F, Fut>(mut self, phase: CallbackPhase, state: T, callback: F) -> Self
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.insert(
            (phase, state),
            Box::new(move |event| Box::pin(callback(event))),
        );
        self
    }

    /// Assemble the gated machine.
    pub fn build(self) -> GatedMachine<T> {
        GatedMachine {
            inner: Arc::new(GatedInner {
                state: Mutex::new(self.initial),
                trigger_mu: tokio::sync::Mutex::new(()),
                allowed: self.allowed,
                callbacks: self.callbacks,
            }),
        }
    }
}
