//! Ripple Core
//!
//! A reactive computation cache with dependency tracking and invalidation
//! that crosses process boundaries.
//!
//! - Compute functions are memoized by input. Values read while computing
//!   become dependencies, and invalidating a value invalidates everything
//!   built on it.
//! - RPC peers carry *compute calls*: the server pushes an invalidation when
//!   the value behind a call changes, so client caches stay coherent.
//! - Flows are durable step machines, each driven by a single worker that
//!   applies its events in order.
//!
//! # Architecture
//!
//! - `computed`: the dependency graph, engine and mutable state
//! - `rpc`: peers, calls, codecs and transports
//! - `flow`: flow registry, persistence, workers and host
//! - `kvstore`: a sharded key-value store with computed reads
//! - `retry`, `timeouts`, `channel`, `clock`: shared plumbing
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::computed::{ComputeContext, ComputedInput, Engine};
//!
//! let engine = Engine::default();
//! let raw = engine.state(5);
//!
//! let doubled = engine
//!     .call(ComputedInput::unit("doubled"), &ComputeContext::new(), &cancel, |ctx| {
//!         let raw = raw.clone();
//!         async move { Ok(raw.get(&ctx)? * 2) }
//!     })
//!     .await;
//! assert_eq!(doubled.ok(), Some(10));
//!
//! raw.set(7); // "doubled" is invalidated and recomputes as 14 on next call
//! ```

pub mod channel;
pub mod clock;
pub mod computed;
pub mod config;
pub mod error;
pub mod flow;
pub mod kvstore;
pub mod outcome;
pub mod retry;
pub mod rpc;
pub mod timeouts;

pub use computed::{ComputeContext, Computed, ComputedInput, Engine};
pub use config::Settings;
pub use error::{Error, Result};
pub use outcome::{Cancelled, Outcome};
