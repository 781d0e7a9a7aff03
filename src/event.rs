//! Per-drive event context and hook outcome types.
//!
//! Hooks receive an [`Event`] snapshot (state being processed, cancellation
//! token, caller arguments) and return an [`Outcome`] telling the engine how
//! to proceed. The outcome is the hook's return value rather than a mutable
//! slot on the event, so a hook cannot forget to publish its decision.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// A single positional argument carried by a drive call.
///
/// Arguments are type-erased; hooks recover them with [`Event::arg`].
pub type Arg = Box<dyn Any + Send + Sync>;

/// Boxed future returned by a registered hook.
pub type HookFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

/// Type-erased hook as stored in the registry.
pub(crate) type Hook<T> = Box<dyn Fn(Event<T>) -> HookFuture + Send + Sync>;

/// The point in a state's processing at which a hook runs.
///
/// Phases always execute in the order `Before`, `Enter`, `After`. A hook
/// that returns a non-[`Outcome::Continue`] outcome short-circuits the
/// remaining phases for that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Runs before the state is entered.
    Before,
    /// Runs upon entering the state.
    Enter,
    /// Runs after the state has settled.
    After,
}

impl Phase {
    pub(crate) const ALL: [Phase; 3] = [Phase::Before, Phase::Enter, Phase::After];
}

/// Registry key: a hook is bound to one `(phase, state)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HookKey<T> {
    pub(crate) phase: Phase,
    pub(crate) state: T,
}

/// Decision a hook hands back to the transition engine.
#[derive(Debug)]
pub enum Outcome {
    /// Proceed with the remaining phases and the table-declared transition.
    Continue,
    /// Re-run the current state's step after the given delay.
    ///
    /// In synchronous mode the engine sleeps in place; in asynchronous mode
    /// it reports a retry cause, schedules a timer callback and returns.
    Retry(Duration),
    /// Stop the chain; reported as a canceled cause.
    Cancel,
    /// Stop the chain with an error, propagated verbatim to the handler.
    Fail(BoxError),
}

impl Outcome {
    /// Shorthand for [`Outcome::Fail`] from anything convertible to a boxed
    /// error, including string literals.
    pub fn fail(err: impl Into<BoxError>) -> Self {
        Outcome::Fail(err.into())
    }
}

/// Snapshot handed to a hook for one invocation.
///
/// Events are cheap to clone and carry the state the hook is bound to, the
/// drive's cancellation token, and the caller-supplied arguments shared
/// across the whole chain.
pub struct Event<T> {
    state: T,
    token: CancellationToken,
    args: Arc<Vec<Arg>>,
}

impl<T> Event<T> {
    pub(crate) fn new(state: T, token: CancellationToken, args: Arc<Vec<Arg>>) -> Self {
        Self { state, token, args }
    }

    /// The state being processed when this hook was dispatched.
    pub fn state(&self) -> &T {
        &self.state
    }

    /// The cancellation token supplied to the top-level drive call.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// All caller-supplied arguments, in order.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// The argument at `idx`, downcast to `A`.
    ///
    /// Returns `None` if the index is out of range or the argument is of a
    /// different type.
    pub fn arg<A: Any>(&self, idx: usize) -> Option<&A> {
        self.args.get(idx)?.downcast_ref::<A>()
    }
}

impl<T: Clone> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            token: self.token.clone(),
            args: Arc::clone(&self.args),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("state", &self.state)
            .field("args", &self.args.len())
            .finish()
    }
}
