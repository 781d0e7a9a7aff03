//! # Async Chained State Machine
//!
//! A generic, embeddable finite state machine that walks chains of states
//! automatically, with three-phase hooks, deferred retries and a strict
//! per-machine serialization contract.
//!
//! ## Features
//!
//! - 🔗 **Automatic Chaining**: declare `src → dest` transitions once; one
//!   [`Machine::drive`] call walks the whole chain to its terminal state
//! - 🪝 **Three-Phase Hooks**: async callbacks before entering, on entering
//!   and after settling each state, able to cancel, fail or retry the chain
//! - ⏰ **Deferred Retries**: a hook can re-run its state after a delay,
//!   in place or via a shared timing-wheel scheduler that returns control
//!   to the caller immediately
//! - 🛂 **Gated Mode**: an alternative [`GatedMachine`] where transitions
//!   are requested explicitly and checked against an allow-list
//! - 🧵 **Thread Safe**: any number of callers may drive the same machine;
//!   top-level drives never interleave their hook executions
//!
//! ## Quick Start
//!
//! ```rust
//! use async_chained_fsm::{CancellationToken, Machine, Outcome};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Order { Placed, Paid, Shipped }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let machine = Machine::builder(Order::Placed)
//!     .transition(Order::Placed, Order::Paid)
//!     .transition(Order::Paid, Order::Shipped)
//!     .on_enter(Order::Paid, |_event| async {
//!         // charge the card here
//!         Outcome::Continue
//!     })
//!     .error_handler(|state, cause| {
//!         if !cause.is_retry() {
//!             eprintln!("stopped in {state:?}: {cause}");
//!         }
//!     })
//!     .build();
//!
//! machine.drive(CancellationToken::new(), Vec::new()).await;
//! assert_eq!(machine.state(), Order::Shipped);
//! # }
//! ```
//!
//! Outcomes are reported only through the configured error handler — `drive`
//! never returns a value, and a normally terminated chain reports nothing.
//! See [`Machine`] for the full concurrency contract.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

mod builder;
mod error;
mod event;
mod fsm;
mod gated;
pub mod scheduler;

pub use builder::MachineBuilder;
pub use error::{BoxError, Cause, TriggerError};
pub use event::{Arg, Event, HookFuture, Outcome, Phase};
pub use fsm::Machine;
pub use gated::{CallbackFuture, GatedBuilder, GatedMachine};
pub use scheduler::{Scheduler, TimerHandle, TimerWheel};

pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    //! Prelude module for convenient imports
    pub use crate::{
        CancellationToken, Cause, Duration, GatedMachine, Machine, Outcome, Phase, TriggerError,
    };
}
