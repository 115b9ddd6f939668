//! Computed Nodes
//!
//! A [`Computed<T>`] is one memoized output of a compute function for one
//! [`ComputedInput`], plus the bookkeeping needed to invalidate it.
//!
//! # Lifecycle
//!
//! ```text
//!   Computing ──output set──► Consistent ──invalidate──► Invalidated
//!       │                                                    ▲
//!       └──────────── cancelled / invalidated early ─────────┘
//! ```
//!
//! - The output is set exactly once and never changes afterwards.
//! - Invalidated is terminal. Invalidating twice is a no-op, and invalidation
//!   handlers run exactly once.
//! - A node invalidated while still computing stays computing; it moves to
//!   Invalidated the moment its output is set.
//!
//! # Edges
//!
//! Each node keeps strong handles to the nodes it read (`dependencies`) and
//! weak back-edges to the nodes that read it (`used_by`). Back-edges are keyed
//! by `(input, version)`, so a stale edge can never invalidate a newer node
//! produced for the same input.
//!
//! # Memory Layout
//!
//! - input + version + creation time
//! - a mutex around the mutable state (output, edges, handlers)
//! - a `watch` channel that flips to `true` on invalidation, for async waiters

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use super::engine::EngineShared;
use super::input::ComputedInput;
use super::invalidation::invalidate_from;
use crate::error::{Error, Result};

/// Counter for node versions. Versions are unique across all inputs.
static VERSION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    VERSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyState {
    Computing,
    Consistent,
    Invalidated,
}

type InvalidationHandler = Box<dyn FnOnce() + Send>;

/// Type-erased node, as seen by the registry and the invalidation walk.
pub(crate) trait ComputedNode: Send + Sync + 'static {
    fn input(&self) -> &ComputedInput;

    fn version(&self) -> u64;

    fn state(&self) -> ConsistencyState;

    fn created_at(&self) -> Instant;

    /// Record that `dependant` read this node.
    ///
    /// Returns `false` if this node is already invalidated, in which case the
    /// dependant observed a stale value.
    fn add_used_by(&self, dependant: &Arc<dyn ComputedNode>) -> bool;

    fn remove_used_by(&self, input: &ComputedInput, version: u64);

    fn add_dependency(&self, dependency: Arc<dyn ComputedNode>);

    /// Live dependants, without changing anything.
    fn used_by(&self) -> Vec<Arc<dyn ComputedNode>>;

    fn dependency_count(&self) -> usize;

    /// One step of invalidation.
    ///
    /// Returns the dependants to continue with, or `None` if this node was
    /// already invalidated or is still computing.
    fn invalidate_self(&self) -> Option<Vec<Arc<dyn ComputedNode>>>;

    fn subscribe_invalidated(&self) -> watch::Receiver<bool>;

    fn on_invalidated_boxed(&self, handler: InvalidationHandler);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct NodeState<T> {
    consistency: ConsistencyState,
    invalidate_on_set_output: bool,
    output: Option<Result<T>>,
    dependencies: SmallVec<[Arc<dyn ComputedNode>; 4]>,
    used_by: IndexMap<(ComputedInput, u64), Weak<dyn ComputedNode>>,
    handlers: Vec<InvalidationHandler>,
}

pub(crate) struct Node<T> {
    input: ComputedInput,
    version: u64,
    created_at: Instant,
    engine: Weak<EngineShared>,
    state: Mutex<NodeState<T>>,
    invalidated: watch::Sender<bool>,
}

impl<T> Node<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn with_state(
        input: ComputedInput,
        engine: Weak<EngineShared>,
        consistency: ConsistencyState,
        output: Option<Result<T>>,
    ) -> Arc<Self> {
        let (invalidated, _) = watch::channel(false);
        Arc::new(Self {
            input,
            version: next_version(),
            created_at: Instant::now(),
            engine,
            state: Mutex::new(NodeState {
                consistency,
                invalidate_on_set_output: false,
                output,
                dependencies: SmallVec::new(),
                used_by: IndexMap::new(),
                handlers: Vec::new(),
            }),
            invalidated,
        })
    }

    /// A node whose compute function is about to run.
    pub(crate) fn computing(input: ComputedInput, engine: Weak<EngineShared>) -> Arc<Self> {
        Self::with_state(input, engine, ConsistencyState::Computing, None)
    }

    /// A node whose output is known up front (mutable state).
    pub(crate) fn consistent(
        input: ComputedInput,
        output: Result<T>,
        engine: Weak<EngineShared>,
    ) -> Arc<Self> {
        Self::with_state(input, engine, ConsistencyState::Consistent, Some(output))
    }

    /// Set the output of a computing node.
    ///
    /// Returns `true` if the node is consistent afterwards.
    pub(crate) fn complete(self: &Arc<Self>, output: Result<T>) -> bool {
        let invalidate_now = {
            let mut state = self.state.lock();
            if state.consistency != ConsistencyState::Computing {
                return state.consistency == ConsistencyState::Consistent;
            }
            state.output = Some(output);
            state.consistency = ConsistencyState::Consistent;
            state.invalidate_on_set_output
        };
        if invalidate_now {
            trace!(input = %self.input, version = self.version, "invalidated while computing");
            invalidate_from(self.clone());
            return false;
        }
        true
    }

    /// Move a computing node straight to Invalidated without an output.
    pub(crate) fn abandon(self: &Arc<Self>) {
        let state = self.state.lock();
        if state.consistency != ConsistencyState::Computing {
            return;
        }
        for dependant in self.finish_invalidation(state) {
            invalidate_from(dependant);
        }
    }

    pub(crate) fn output(&self) -> Result<T> {
        match &self.state.lock().output {
            Some(output) => output.clone(),
            None => Err(Error::Internal(format!(
                "computed {} has no output",
                self.input
            ))),
        }
    }

    fn finish_invalidation(
        &self,
        mut state: MutexGuard<'_, NodeState<T>>,
    ) -> Vec<Arc<dyn ComputedNode>> {
        state.consistency = ConsistencyState::Invalidated;
        let handlers = std::mem::take(&mut state.handlers);
        let dependencies = std::mem::take(&mut state.dependencies);
        let used_by = std::mem::take(&mut state.used_by);
        drop(state);

        self.invalidated.send_replace(true);
        if let Some(engine) = self.engine.upgrade() {
            engine.forget(&self.input, self.version);
        }
        for dependency in dependencies {
            dependency.remove_used_by(&self.input, self.version);
        }
        trace!(input = %self.input, version = self.version, "invalidated");
        for handler in handlers {
            handler();
        }
        used_by.into_values().filter_map(|edge| edge.upgrade()).collect()
    }
}

impl<T> ComputedNode for Node<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn input(&self) -> &ComputedInput {
        &self.input
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn state(&self) -> ConsistencyState {
        self.state.lock().consistency
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn add_used_by(&self, dependant: &Arc<dyn ComputedNode>) -> bool {
        let mut state = self.state.lock();
        if state.consistency == ConsistencyState::Invalidated {
            return false;
        }
        let key = (dependant.input().clone(), dependant.version());
        state.used_by.insert(key, Arc::downgrade(dependant));
        true
    }

    fn remove_used_by(&self, input: &ComputedInput, version: u64) {
        let mut state = self.state.lock();
        state.used_by.shift_remove(&(input.clone(), version));
    }

    fn add_dependency(&self, dependency: Arc<dyn ComputedNode>) {
        let mut state = self.state.lock();
        if state.consistency != ConsistencyState::Invalidated {
            state.dependencies.push(dependency);
        }
    }

    fn used_by(&self) -> Vec<Arc<dyn ComputedNode>> {
        let state = self.state.lock();
        state.used_by.values().filter_map(|edge| edge.upgrade()).collect()
    }

    fn dependency_count(&self) -> usize {
        self.state.lock().dependencies.len()
    }

    fn invalidate_self(&self) -> Option<Vec<Arc<dyn ComputedNode>>> {
        let mut state = self.state.lock();
        let consistency = state.consistency;
        match consistency {
            ConsistencyState::Invalidated => None,
            ConsistencyState::Computing => {
                state.invalidate_on_set_output = true;
                None
            }
            ConsistencyState::Consistent => Some(self.finish_invalidation(state)),
        }
    }

    fn subscribe_invalidated(&self) -> watch::Receiver<bool> {
        self.invalidated.subscribe()
    }

    fn on_invalidated_boxed(&self, handler: InvalidationHandler) {
        let mut state = self.state.lock();
        if state.consistency == ConsistencyState::Invalidated {
            drop(state);
            handler();
        } else {
            state.handlers.push(handler);
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recover the typed node behind an erased one.
pub(crate) fn downcast<T>(node: Arc<dyn ComputedNode>) -> Option<Computed<T>>
where
    T: Clone + Send + Sync + 'static,
{
    node.into_any().downcast::<Node<T>>().ok().map(Computed::from_node)
}

async fn wait_invalidated(mut receiver: watch::Receiver<bool>) {
    // The sender lives inside the node; an error means the node is gone.
    let _ = receiver.wait_for(|invalidated| *invalidated).await;
}

/// A memoized output plus its invalidation state.
///
/// Cloning is cheap: clones share the same node.
pub struct Computed<T> {
    node: Arc<Node<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_node(node: Arc<Node<T>>) -> Self {
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<Node<T>> {
        &self.node
    }

    pub(crate) fn erased(&self) -> Arc<dyn ComputedNode> {
        self.node.clone()
    }

    pub fn input(&self) -> &ComputedInput {
        &self.node.input
    }

    /// Unique version tag; every recomputation gets a new one.
    pub fn version(&self) -> u64 {
        self.node.version
    }

    pub fn state(&self) -> ConsistencyState {
        ComputedNode::state(self.node.as_ref())
    }

    pub fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    /// The captured output: the value or the error the compute function
    /// returned. Stays readable after invalidation.
    pub fn output(&self) -> Result<T> {
        self.node.output()
    }

    /// Invalidate this node and everything that transitively depends on it.
    ///
    /// Returns the number of nodes that changed state.
    pub fn invalidate(&self) -> usize {
        invalidate_from(self.erased())
    }

    /// Resolves once this node is invalidated (immediately if it already is).
    pub async fn when_invalidated(&self) {
        wait_invalidated(self.node.subscribe_invalidated()).await
    }

    /// Run `handler` once, on invalidation. Runs right away if the node is
    /// already invalidated.
    pub fn on_invalidated<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.node.on_invalidated_boxed(Box::new(handler));
    }

    /// Number of nodes this one read while computing.
    pub fn dependency_count(&self) -> usize {
        self.node.dependency_count()
    }

    pub fn used_by_count(&self) -> usize {
        self.node.used_by().len()
    }

    pub fn handle(&self) -> ComputedHandle {
        ComputedHandle(self.erased())
    }
}

impl<T> fmt::Debug for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("input", self.input())
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

/// An untyped handle to a computed node.
#[derive(Clone)]
pub struct ComputedHandle(Arc<dyn ComputedNode>);

impl ComputedHandle {
    pub(crate) fn new(node: Arc<dyn ComputedNode>) -> Self {
        Self(node)
    }

    pub fn input(&self) -> &ComputedInput {
        self.0.input()
    }

    pub fn version(&self) -> u64 {
        self.0.version()
    }

    pub fn state(&self) -> ConsistencyState {
        self.0.state()
    }

    pub fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    pub fn invalidate(&self) -> usize {
        invalidate_from(self.0.clone())
    }

    pub async fn when_invalidated(&self) {
        wait_invalidated(self.0.subscribe_invalidated()).await
    }

    pub fn on_invalidated<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.0.on_invalidated_boxed(Box::new(handler));
    }
}

impl fmt::Debug for ComputedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedHandle")
            .field("input", self.input())
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn detached<T: Clone + Send + Sync + 'static>(method: &str, value: T) -> Arc<Node<T>> {
        Node::consistent(ComputedInput::unit(method), Ok(value), Weak::new())
    }

    #[test]
    fn versions_are_unique() {
        let a = detached("a", 1);
        let b = detached("a", 1);
        assert_ne!(a.version, b.version);
    }

    #[test]
    fn handlers_fire_exactly_once() {
        let node = Computed::from_node(detached("a", 1));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        node.on_invalidated(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(node.invalidate(), 1);
        assert_eq!(node.invalidate(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(node.state(), ConsistencyState::Invalidated);

        // Late subscribers run immediately.
        let counter = fired.clone();
        node.on_invalidated(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn output_survives_invalidation() {
        let node = Computed::from_node(detached("a", 42));
        node.invalidate();
        assert_eq!(node.output().unwrap(), 42);
    }

    #[test]
    fn invalidating_a_computing_node_is_deferred() {
        let node: Arc<Node<i32>> = Node::computing(ComputedInput::unit("a"), Weak::new());
        assert!(node.invalidate_self().is_none());
        assert_eq!(ComputedNode::state(node.as_ref()), ConsistencyState::Computing);

        assert!(!node.complete(Ok(1)));
        assert_eq!(ComputedNode::state(node.as_ref()), ConsistencyState::Invalidated);
        assert_eq!(node.output().unwrap(), 1);
    }

    #[test]
    fn abandoned_node_has_no_output() {
        let node: Arc<Node<i32>> = Node::computing(ComputedInput::unit("a"), Weak::new());
        node.abandon();
        assert_eq!(ComputedNode::state(node.as_ref()), ConsistencyState::Invalidated);
        assert!(node.output().is_err());
    }

    #[test]
    fn stale_dependency_is_reported() {
        let dependency = detached("dep", 1);
        let dependant: Arc<dyn ComputedNode> = detached("user", 2);
        dependency.invalidate_self();
        assert!(!dependency.add_used_by(&dependant));
    }

    #[test]
    fn downcast_checks_the_type() {
        let erased: Arc<dyn ComputedNode> = detached("a", 1i32);
        assert!(downcast::<String>(erased.clone()).is_none());
        assert_eq!(downcast::<i32>(erased).unwrap().output().unwrap(), 1);
    }
}
