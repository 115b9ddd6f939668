//! Compute Context
//!
//! A [`ComputeContext`] says what the current call is doing with the nodes it
//! reads. It is passed explicitly to every compute function.
//!
//! - `ComputeContext::new()` tracks nothing. Top-level callers use it.
//! - A *producing* context belongs to a node whose compute function is
//!   running. Every node read through it becomes a dependency of that node.
//! - A *capturing* context remembers the first node read through it, which
//!   is how [`capture`] hands the caller the `Computed` behind a call.
//!
//! Because the context is a value rather than thread-local state, dependency
//! tracking survives `.await` points and task hops.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use super::invalidation::invalidate_from;
use super::node::{downcast, Computed, ComputedHandle, ComputedNode};

enum ContextKind {
    Producing(Arc<dyn ComputedNode>),
    Capturing(Mutex<Option<Arc<dyn ComputedNode>>>),
}

#[derive(Clone, Default)]
pub struct ComputeContext {
    kind: Option<Arc<ContextKind>>,
}

impl ComputeContext {
    /// A context that records nothing.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn producing(node: Arc<dyn ComputedNode>) -> Self {
        Self {
            kind: Some(Arc::new(ContextKind::Producing(node))),
        }
    }

    pub(crate) fn capturing() -> Self {
        Self {
            kind: Some(Arc::new(ContextKind::Capturing(Mutex::new(None)))),
        }
    }

    /// Whether reads through this context record dependencies.
    pub fn is_tracking(&self) -> bool {
        matches!(self.kind.as_deref(), Some(ContextKind::Producing(_)))
    }

    /// The node currently being produced, if any.
    pub fn dependant(&self) -> Option<ComputedHandle> {
        match self.kind.as_deref() {
            Some(ContextKind::Producing(node)) => Some(ComputedHandle::new(node.clone())),
            _ => None,
        }
    }

    /// Record that the current call read `used`.
    pub(crate) fn use_node(&self, used: Arc<dyn ComputedNode>) {
        match self.kind.as_deref() {
            None => {}
            Some(ContextKind::Producing(dependant)) => {
                if !used.add_used_by(dependant) {
                    // The value we just read is already stale.
                    invalidate_from(dependant.clone());
                }
                dependant.add_dependency(used);
            }
            Some(ContextKind::Capturing(slot)) => {
                let mut slot = slot.lock();
                if slot.is_none() {
                    *slot = Some(used);
                }
            }
        }
    }

    pub(crate) fn take_captured(&self) -> Option<Arc<dyn ComputedNode>> {
        match self.kind.as_deref() {
            Some(ContextKind::Capturing(slot)) => slot.lock().take(),
            _ => None,
        }
    }
}

/// Run `f` and return the `Computed` behind the first compute call it makes.
///
/// ```rust,ignore
/// let computed = capture::<i32, _, _>(|ctx| async move {
///     engine.call(input, &ctx, &cancel, compute).await
/// }).await;
/// ```
pub async fn capture<T, F, Fut>(f: F) -> Option<Computed<T>>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(ComputeContext) -> Fut,
    Fut: Future,
{
    let context = ComputeContext::capturing();
    f(context.clone()).await;
    context.take_captured().and_then(downcast::<T>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::input::ComputedInput;
    use crate::computed::node::{ConsistencyState, Node};
    use std::sync::Weak;

    fn node(method: &str) -> Arc<dyn ComputedNode> {
        Node::consistent(ComputedInput::unit(method), Ok(1i32), Weak::new())
    }

    #[test]
    fn plain_context_records_nothing() {
        let used = node("used");
        ComputeContext::new().use_node(used.clone());
        assert!(used.used_by().is_empty());
    }

    #[test]
    fn producing_context_links_both_directions() {
        let dependant = node("dependant");
        let used = node("used");
        let context = ComputeContext::producing(dependant.clone());
        assert!(context.is_tracking());

        context.use_node(used.clone());
        assert_eq!(used.used_by().len(), 1);
        assert_eq!(dependant.dependency_count(), 1);
    }

    #[test]
    fn reading_a_stale_node_invalidates_the_dependant() {
        let dependant = node("dependant");
        let used = node("used");
        used.invalidate_self();

        ComputeContext::producing(dependant.clone()).use_node(used);
        assert_eq!(dependant.state(), ConsistencyState::Invalidated);
    }

    #[test]
    fn capturing_context_keeps_the_first_node() {
        let first = node("first");
        let context = ComputeContext::capturing();
        context.use_node(first.clone());
        context.use_node(node("second"));

        let captured = context.take_captured().unwrap();
        assert_eq!(captured.version(), first.version());
    }
}
