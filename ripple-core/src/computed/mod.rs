//! Computed Graph
//!
//! Memoized, dependency-tracked computations with explicit invalidation.
//!
//! # Core Concepts
//!
//! - **ComputedInput**: The identity of a call (method name + arguments).
//!
//! - **Computed**: One memoized output for one input. It moves from
//!   Computing to Consistent to Invalidated, and never back.
//!
//! - **Engine**: Owns the registry of consistent nodes and guarantees at most
//!   one computation per input at a time.
//!
//! - **ComputeContext**: Passed to compute functions; reads made through it
//!   become dependencies of the node being produced.
//!
//! - **MutableState**: A leaf node set from outside.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = Engine::default();
//! let price = engine.state(10);
//!
//! let total = engine.call(ComputedInput::unit("total"), &ComputeContext::new(), &cancel, |ctx| {
//!     let price = price.clone();
//!     async move { Ok(price.get(&ctx)? * 3) }
//! }).await;
//!
//! price.set(20);   // "total" is invalidated and recomputes on next call
//! ```

mod context;
mod engine;
mod input;
mod invalidation;
mod node;
mod options;
mod registry;
mod state;

pub use context::{capture, ComputeContext};
pub use engine::Engine;
pub use input::ComputedInput;
pub use node::{Computed, ComputedHandle, ConsistencyState};
pub use options::ComputedOptions;
pub use state::MutableState;
