//! Flows
//!
//! Durable, step-driven state machines advanced by events. Each flow id gets
//! a single worker that applies its events in order and saves the flow after
//! every step.
//!
//! ```text
//! FlowHost ──► FlowWorker (per FlowId) ──► FlowType step table
//!                   │
//!                   └──► Flows ──► FlowStore
//! ```

#[allow(clippy::module_inception)]
mod flow;
mod data;
mod host;
mod id;
mod registry;
mod store;
mod worker;

pub use data::FlowData;
pub use flow::{steps, Event, FlowCore, FlowState, StepContext, Transition};
pub use host::{FlowHost, FlowOptions};
pub use id::{FlowId, Symbol};
pub use registry::{FlowRegistry, FlowRegistryBuilder, FlowType};
pub use store::{FlowSnapshot, FlowStore, Flows, InMemoryFlowStore};
pub use worker::FlowWorker;
