//! Mutable State
//!
//! A [`MutableState`] is a computed node whose value is set from outside
//! rather than produced by a compute function. It is the usual leaf of a
//! dependency graph: compute functions read it, and `set` invalidates them.
//!
//! # How Updates Work
//!
//! Each `set` creates a fresh consistent node for the same input, registers
//! it, and invalidates the previous node. Readers that depended on the old
//! value are invalidated through their back-edges; new readers attach to the
//! new node.
//!
//! ```rust,ignore
//! let count = engine.state(0);
//!
//! // Read the value (recording a dependency when ctx is producing)
//! let value = count.get(&ctx)?;
//!
//! // Update the value (invalidates dependants)
//! count.set(5);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::engine::Engine;
use super::input::ComputedInput;
use super::node::{Computed, Node};
use super::ComputeContext;
use crate::error::{Error, Result};

/// Counter for generating unique state IDs.
static STATE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Clones share the same value.
pub struct MutableState<T>
where
    T: Clone + Send + Sync + 'static,
{
    engine: Engine,
    input: ComputedInput,
    current: Arc<Mutex<Computed<T>>>,
}

impl<T> Clone for MutableState<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            input: self.input.clone(),
            current: Arc::clone(&self.current),
        }
    }
}

impl<T> MutableState<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(engine: &Engine, value: T) -> Self {
        let id = STATE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let input = ComputedInput::unit(&format!("$state#{id}"));
        let node = Node::consistent(input.clone(), Ok(value), engine.weak_shared());
        engine.publish(node.clone());
        Self {
            engine: engine.clone(),
            input,
            current: Arc::new(Mutex::new(Computed::from_node(node))),
        }
    }

    pub fn input(&self) -> &ComputedInput {
        &self.input
    }

    /// The node holding the current value.
    pub fn computed(&self) -> Computed<T> {
        self.current.lock().clone()
    }

    /// Read the value, recording a dependency on it.
    pub fn get(&self, context: &ComputeContext) -> Result<T> {
        let computed = self.computed();
        context.use_node(computed.erased());
        computed.output()
    }

    /// Read the value without recording a dependency.
    pub fn get_untracked(&self) -> Result<T> {
        self.computed().output()
    }

    /// Set a new value and invalidate everything that read the old one.
    pub fn set(&self, value: T) {
        self.replace(Ok(value));
    }

    /// Store an error; readers see it as the output.
    pub fn set_error(&self, error: Error) {
        self.replace(Err(error));
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.get_untracked()?;
        self.set(f(&current));
        Ok(())
    }

    fn replace(&self, output: Result<T>) {
        let node = Node::consistent(self.input.clone(), output, self.engine.weak_shared());
        let previous = {
            let mut current = self.current.lock();
            std::mem::replace(&mut *current, Computed::from_node(node.clone()))
        };
        // Publishing invalidates the registered predecessor; the explicit call
        // covers a predecessor that was already pruned from the registry.
        self.engine.publish(node);
        previous.invalidate();
    }
}
