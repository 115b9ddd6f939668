//! Computed Registry
//!
//! Maps each [`ComputedInput`] to its current consistent node. The registry
//! is owned by an [`Engine`](super::Engine) and holds strong handles, so a
//! registered node lives until it is invalidated or pruned.
//!
//! Replacing a node is a single map insert: readers see either the old node
//! or the new one, never a gap.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::input::ComputedInput;
use super::node::{ComputedNode, ConsistencyState};

#[derive(Default)]
pub(crate) struct ComputedRegistry {
    nodes: DashMap<ComputedInput, Arc<dyn ComputedNode>>,
}

impl ComputedRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, input: &ComputedInput) -> Option<Arc<dyn ComputedNode>> {
        self.nodes.get(input).map(|entry| Arc::clone(entry.value()))
    }

    /// Register `node`, returning the previous node if it is still consistent
    /// and must be invalidated by the caller.
    pub(crate) fn register(&self, node: Arc<dyn ComputedNode>) -> Option<Arc<dyn ComputedNode>> {
        let version = node.version();
        let previous = self.nodes.insert(node.input().clone(), node)?;
        (previous.version() != version && previous.state() == ConsistencyState::Consistent)
            .then_some(previous)
    }

    /// Remove the entry for `input` if it still holds `version`.
    pub(crate) fn unregister(&self, input: &ComputedInput, version: u64) -> bool {
        self.nodes
            .remove_if(input, |_, node| node.version() == version)
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Drop nodes nothing outside the registry references, once they are
    /// older than `min_age`.
    pub(crate) fn prune(&self, min_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.nodes.len();
        self.nodes.retain(|_, node| {
            Arc::strong_count(node) > 1 || node.created_at() + min_age > now
        });
        let pruned = before.saturating_sub(self.nodes.len());
        if pruned > 0 {
            debug!(pruned, remaining = self.nodes.len(), "pruned computed registry");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::node::Node;
    use std::sync::Weak;

    fn node(method: &str) -> Arc<dyn ComputedNode> {
        Node::consistent(ComputedInput::unit(method), Ok(1u8), Weak::new())
    }

    #[test]
    fn register_returns_consistent_predecessor() {
        let registry = ComputedRegistry::new();
        let first = node("a");
        let second = node("a");

        assert!(registry.register(first.clone()).is_none());
        let replaced = registry.register(second.clone()).expect("first is consistent");
        assert_eq!(replaced.version(), first.version());
        assert_eq!(registry.get(first.input()).unwrap().version(), second.version());
    }

    #[test]
    fn unregister_checks_the_version() {
        let registry = ComputedRegistry::new();
        let first = node("a");
        let second = node("a");
        registry.register(first.clone());
        registry.register(second.clone());

        assert!(!registry.unregister(first.input(), first.version()));
        assert!(registry.unregister(second.input(), second.version()));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn prune_keeps_referenced_nodes() {
        let registry = ComputedRegistry::new();
        let kept = node("kept");
        registry.register(kept.clone());
        registry.register(node("dropped"));

        assert_eq!(registry.prune(Duration::ZERO), 1);
        assert!(registry.get(kept.input()).is_some());
        assert!(registry.get(&ComputedInput::unit("dropped")).is_none());
    }
}
