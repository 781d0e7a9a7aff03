//! Interruption causes and gated-mode errors.

use std::fmt::Debug;
use thiserror::Error;

/// Boxed error a hook may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cause reported to the configured error handler when a chain stops early.
///
/// Every interruption is reported exactly once as `(final_state, cause)`.
/// [`Cause::Retry`] is not a true failure: in asynchronous retry mode the
/// handler sees it while the deferred continuation is still pending, and is
/// expected to take no terminal action for it.
#[derive(Error, Debug)]
pub enum Cause<T: Debug> {
    /// A hook requested a deferred retry from this state.
    #[error("will retry from state {0:?}")]
    Retry(T),

    /// A hook canceled the chain in this state.
    #[error("chain canceled in state {0:?}")]
    Canceled(T),

    /// The cancellation token was already triggered at a step boundary.
    #[error("cancellation requested upstream, stopped in state {0:?}")]
    Interrupted(T),

    /// A hook failed with its own error, propagated verbatim.
    #[error("hook failed: {0}")]
    Hook(BoxError),
}

impl<T: Debug> Cause<T> {
    /// True for retry notifications, which handlers typically ignore.
    pub fn is_retry(&self) -> bool {
        matches!(self, Cause::Retry(_))
    }
}

/// Error returned by [`GatedMachine::trigger`](crate::GatedMachine::trigger).
#[derive(Error, Debug)]
pub enum TriggerError<T: Debug> {
    /// The target state is not in the current state's allow-list.
    #[error("trigger to {to:?} is not allowed from state {from:?}")]
    NotAllowed {
        /// State the machine was in when the trigger was attempted.
        from: T,
        /// Requested target state.
        to: T,
    },

    /// The cancellation token was already triggered before any callback ran.
    #[error("trigger canceled before running, state {0:?}")]
    Interrupted(T),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_is_not_a_failure() {
        assert!(Cause::Retry(1u8).is_retry());
        assert!(!Cause::Canceled(1u8).is_retry());
        assert!(!Cause::<u8>::Hook("oops".into()).is_retry());
    }

    #[test]
    fn display_carries_the_state() {
        let cause = Cause::Canceled("uploading");
        assert_eq!(cause.to_string(), "chain canceled in state \"uploading\"");

        let err = TriggerError::NotAllowed {
            from: "idle",
            to: "done",
        };
        assert_eq!(
            err.to_string(),
            "trigger to \"done\" is not allowed from state \"idle\""
        );
    }
}
