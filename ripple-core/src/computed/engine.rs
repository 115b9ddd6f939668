//! Computed Engine
//!
//! The engine is the central coordinator for memoized calls. It owns the
//! registry of consistent nodes, the per-input locks that keep at most one
//! computation running per input, and the timers behind auto-invalidation.
//!
//! # How a Call Works
//!
//! 1. Look up a consistent node for the input. If found, record it as a
//!    dependency of the caller and return it.
//!
//! 2. Otherwise take the input's async lock, waiting for any computation
//!    already in flight. Re-check the registry: the computation we waited
//!    on may have produced what we need.
//!
//! 3. Create a fresh node in the Computing state and run the compute function
//!    with a context that records every node it reads.
//!
//! 4. Finalize:
//!    a. Cancelled: invalidate the partial node at once and register nothing.
//!    b. Transient error: retry per the reprocessing policy, then cache it.
//!    c. Otherwise: store the output (value or error), register the node
//!       (replacing the old one), and start its auto-invalidation timer.
//!
//! Panics inside a compute function are caught and stored as errors.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::ComputeContext;
use super::input::ComputedInput;
use super::invalidation::{invalidate_from, transitive_dependants};
use super::node::{downcast, Computed, ComputedHandle, ComputedNode, ConsistencyState, Node};
use super::options::ComputedOptions;
use super::registry::ComputedRegistry;
use super::state::MutableState;
use crate::error::{Error, Result};
use crate::outcome::{Cancelled, Outcome};
use crate::retry::RetryPolicy;
use crate::timeouts::TimeoutSet;

pub(crate) struct EngineShared {
    registry: ComputedRegistry,
    locks: DashMap<ComputedInput, Arc<AsyncMutex<()>>>,
    timeouts: TimeoutSet<(ComputedInput, u64)>,
    options: ComputedOptions,
    reprocessing: Arc<dyn RetryPolicy>,
}

impl EngineShared {
    /// Drop every trace of an invalidated node.
    pub(crate) fn forget(&self, input: &ComputedInput, version: u64) {
        self.registry.unregister(input, version);
        self.timeouts.remove(&(input.clone(), version));
    }
}

/// Cheaply cloneable handle to a computed graph.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(ComputedOptions::default())
    }
}

impl Engine {
    pub fn new(options: ComputedOptions) -> Self {
        let reprocessing = Arc::new(options.reprocessing.clone());
        Self::with_reprocessing(options, reprocessing)
    }

    /// Build an engine with a custom reprocessing policy.
    pub fn with_reprocessing(options: ComputedOptions, reprocessing: Arc<dyn RetryPolicy>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                registry: ComputedRegistry::new(),
                locks: DashMap::new(),
                timeouts: TimeoutSet::new(),
                options,
                reprocessing,
            }),
        }
    }

    pub fn options(&self) -> &ComputedOptions {
        &self.shared.options
    }

    pub(crate) fn weak_shared(&self) -> std::sync::Weak<EngineShared> {
        Arc::downgrade(&self.shared)
    }

    /// The registered node for `input`, consistent or not yet pruned.
    pub fn get_existing<T>(&self, input: &ComputedInput) -> Option<Computed<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let node = self.shared.registry.get(input)?;
        let computed = downcast::<T>(node);
        if computed.is_none() {
            warn!(input = %input, "registered computed has a different output type");
        }
        computed
    }

    fn consistent<T>(&self, input: &ComputedInput) -> Option<Computed<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get_existing::<T>(input)
            .filter(|computed| computed.state() == ConsistencyState::Consistent)
    }

    /// Return the consistent node for `input`, producing it with `compute`
    /// if there is none.
    ///
    /// Concurrent calls for the same input share a single computation. The
    /// returned node is recorded as a dependency of `context`.
    pub async fn get_or_produce<T, F, Fut>(
        &self,
        input: ComputedInput,
        context: &ComputeContext,
        cancel: &CancellationToken,
        mut compute: F,
    ) -> std::result::Result<Computed<T>, Cancelled>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(ComputeContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(existing) = self.consistent::<T>(&input) {
            context.use_node(existing.erased());
            return Ok(existing);
        }
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let lock = self.shared.locks.entry(input.clone()).or_default().clone();
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = lock.clone().lock_owned() => Some(guard),
        };
        let result = match guard {
            Some(guard) => {
                let result = self.produce_locked(&input, cancel, &mut compute).await;
                drop(guard);
                result
            }
            None => Err(Cancelled),
        };
        drop(lock);
        self.release_lock(&input);

        let computed = result?;
        context.use_node(computed.erased());
        Ok(computed)
    }

    /// Like [`get_or_produce`](Self::get_or_produce), returning the output.
    pub async fn call<T, F, Fut>(
        &self,
        input: ComputedInput,
        context: &ComputeContext,
        cancel: &CancellationToken,
        compute: F,
    ) -> Outcome<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(ComputeContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.get_or_produce(input, context, cancel, compute).await {
            Ok(computed) => computed.output().into(),
            Err(Cancelled) => Outcome::Cancelled,
        }
    }

    /// `computed` itself if it is still consistent, otherwise the node for
    /// the same input, produced anew if needed.
    pub async fn update<T, F, Fut>(
        &self,
        computed: &Computed<T>,
        cancel: &CancellationToken,
        compute: F,
    ) -> std::result::Result<Computed<T>, Cancelled>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(ComputeContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if computed.is_consistent() {
            return Ok(computed.clone());
        }
        self.get_or_produce(computed.input().clone(), &ComputeContext::new(), cancel, compute)
            .await
    }

    /// Invalidate the registered node for `input` and its dependants.
    ///
    /// Returns the number of nodes invalidated; zero if nothing is cached.
    pub fn invalidate(&self, input: &ComputedInput) -> usize {
        match self.shared.registry.get(input) {
            Some(node) => invalidate_from(node),
            None => 0,
        }
    }

    /// Nodes that transitively depend on the node registered for `input`.
    pub fn dependants(&self, input: &ComputedInput) -> Vec<ComputedHandle> {
        match self.shared.registry.get(input) {
            Some(node) => transitive_dependants(&node)
                .into_iter()
                .map(ComputedHandle::new)
                .collect(),
            None => Vec::new(),
        }
    }

    /// A mutable state node owned by this engine.
    pub fn state<T>(&self, value: T) -> MutableState<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        MutableState::new(self, value)
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of inputs with a computation running or queued.
    pub fn in_flight(&self) -> usize {
        self.shared.locks.len()
    }

    /// Drop registered nodes nothing else references and that are older than
    /// `min_cache_duration`.
    pub fn prune(&self) -> usize {
        self.shared.registry.prune(self.shared.options.min_cache_duration)
    }

    /// Register a node that is already consistent, invalidating whatever it
    /// replaces.
    pub(crate) fn publish(&self, node: Arc<dyn ComputedNode>) {
        let input = node.input().clone();
        let version = node.version();
        if let Some(replaced) = self.shared.registry.register(node.clone()) {
            invalidate_from(replaced);
        }
        if node.state() != ConsistencyState::Consistent {
            // Invalidated between completion and registration.
            self.shared.registry.unregister(&input, version);
        }
    }

    fn release_lock(&self, input: &ComputedInput) {
        self.shared
            .locks
            .remove_if(input, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn produce_locked<T, F, Fut>(
        &self,
        input: &ComputedInput,
        cancel: &CancellationToken,
        compute: &mut F,
    ) -> std::result::Result<Computed<T>, Cancelled>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(ComputeContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(existing) = self.consistent::<T>(input) {
            return Ok(existing);
        }

        let mut failed_attempts = 0u32;
        loop {
            let node = Node::<T>::computing(input.clone(), self.weak_shared());
            let context = ComputeContext::producing(node.clone());
            debug!(input = %input, attempt = failed_attempts, "compute: start");

            let running = AssertUnwindSafe(compute(context)).catch_unwind();
            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                output = running => Some(match output {
                    Ok(output) => output,
                    Err(panic) => Err(Error::Internal(panic_message(panic))),
                }),
            };

            let Some(output) = output else {
                node.abandon();
                debug!(input = %input, "compute: cancelled");
                return Err(Cancelled);
            };

            if let Err(error) = &output {
                failed_attempts += 1;
                if let Some(delay) = self.shared.reprocessing.next_delay(failed_attempts, error) {
                    warn!(input = %input, attempt = failed_attempts, ?delay, error = %error, "compute: retrying");
                    node.abandon();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                debug!(input = %input, error = %error, "compute: err");
            } else {
                debug!(input = %input, version = node.version(), "compute: ok");
            }

            let delay = self.shared.options.invalidation_delay(&output);
            if node.complete(output) {
                self.publish(node.clone());
                if let Some(delay) = delay {
                    self.schedule_invalidation(node.clone(), delay);
                }
            }
            return Ok(Computed::from_node(node));
        }
    }

    fn schedule_invalidation(&self, node: Arc<dyn ComputedNode>, delay: std::time::Duration) {
        let key = (node.input().clone(), node.version());
        let weak = Arc::downgrade(&node);
        self.shared
            .timeouts
            .add_or_update(key, Instant::now() + delay, move || {
                if let Some(node) = weak.upgrade() {
                    invalidate_from(node);
                }
            });
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.shared.registry.len())
            .field("in_flight", &self.shared.locks.len())
            .finish()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("compute function panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("compute function panicked: {message}")
    } else {
        "compute function panicked".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
