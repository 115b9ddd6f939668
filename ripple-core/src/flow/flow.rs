//! Flow Model
//!
//! A flow is a user-defined state value advanced by *steps*. Each step
//! handler receives the current state and (optionally) the event that
//! triggered it, and returns the new state plus a [`Transition`] naming the
//! step that handles the next event.
//!
//! ```text
//!   event ──► [ step: "Start" ] ──► Transition::to("Await")
//!   event ──► [ step: "Await" ] ──► Transition::immediate("Ship")
//!             [ step: "Ship"  ] ──► Transition::stay()      (no event)
//! ```

use std::any::Any;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::id::{FlowId, Symbol};

/// An event delivered to a flow. Steps downcast it to the type they expect.
pub type Event = Arc<dyn Any + Send + Sync>;

/// Bounds a type must meet to be used as flow state.
pub trait FlowState: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> FlowState for T where T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Names of the steps the flow runtime itself dispatches to.
pub mod steps {
    /// Runs once, without an event, right after a flow is created.
    pub const START: &str = "Start";
    /// Entered by a step returning [`Transition::fail`](super::Transition::fail).
    pub const ERROR: &str = "Error";
    /// Receives events the current step does not accept.
    pub const UNSUPPORTED_EVENT: &str = "UnsupportedEvent";
    /// Runs when the current step has no handler.
    pub const NO_STEP: &str = "NoStep";

    pub(crate) fn is_system(step: &str) -> bool {
        matches!(step, START | ERROR | UNSUPPORTED_EVENT | NO_STEP)
    }
}

/// Identity and position of a running flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowCore {
    pub id: FlowId,
    /// Version of the last persisted state. Zero means never stored.
    pub version: i64,
    pub step: Symbol,
}

impl FlowCore {
    pub fn new(id: FlowId, version: i64, step: Symbol) -> Self {
        Self { id, version, step }
    }
}

/// What happens after a step completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Next step; `None` keeps the current one.
    pub step: Option<Symbol>,
    /// Run the next step right away, without waiting for an event.
    pub immediate: bool,
}

impl Transition {
    /// Wait for the next event at `step`.
    pub fn to(step: impl Into<Symbol>) -> Self {
        Self {
            step: Some(step.into()),
            immediate: false,
        }
    }

    /// Run `step` now, with no event.
    pub fn immediate(step: impl Into<Symbol>) -> Self {
        Self {
            step: Some(step.into()),
            immediate: true,
        }
    }

    pub fn stay() -> Self {
        Self {
            step: None,
            immediate: false,
        }
    }

    /// Run the `Error` step now. Unlike returning `Err`, the step's changes
    /// are kept and the result is saved.
    pub fn fail() -> Self {
        Self::immediate(steps::ERROR)
    }
}

/// Passed to every step handler.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub id: FlowId,
    pub version: i64,
    pub step: Symbol,
    /// Cancelled when the owning worker stops for good.
    pub cancel: CancellationToken,
}
