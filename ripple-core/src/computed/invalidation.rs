//! Invalidation Propagation
//!
//! Invalidating a node must invalidate everything that transitively depends
//! on it. The walk uses an explicit stack instead of recursion, so arbitrarily
//! deep dependency chains can't overflow the call stack.
//!
//! # Algorithm
//!
//! 1. Push the root onto the stack.
//! 2. Pop a node and run one invalidation step on it. The step is a no-op if
//!    the node is already invalidated, which also stops cycles and diamonds
//!    from being visited twice.
//! 3. Push every live dependant the step returned.
//! 4. Repeat until the stack is empty.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use super::input::ComputedInput;
use super::node::ComputedNode;

/// Invalidate `root` and its transitive dependants.
///
/// Returns how many nodes moved to Invalidated.
pub(crate) fn invalidate_from(root: Arc<dyn ComputedNode>) -> usize {
    let root_input = root.input().clone();
    let mut pending: Vec<Arc<dyn ComputedNode>> = vec![root];
    let mut invalidated = 0;

    while let Some(node) = pending.pop() {
        if let Some(dependants) = node.invalidate_self() {
            invalidated += 1;
            pending.extend(dependants);
        }
    }

    if invalidated > 1 {
        debug!(root = %root_input, count = invalidated, "invalidation cascade");
    }
    invalidated
}

/// Every live node that transitively depends on `root`, in breadth-first
/// order. `root` itself is not included.
pub(crate) fn transitive_dependants(root: &Arc<dyn ComputedNode>) -> Vec<Arc<dyn ComputedNode>> {
    let mut visited: HashSet<(ComputedInput, u64)> = HashSet::new();
    visited.insert((root.input().clone(), root.version()));

    let mut queue: VecDeque<Arc<dyn ComputedNode>> = root.used_by().into();
    let mut result = Vec::new();

    while let Some(node) = queue.pop_front() {
        if !visited.insert((node.input().clone(), node.version())) {
            continue;
        }
        queue.extend(node.used_by());
        result.push(node);
    }

    result
}
