//! Flow Registry
//!
//! Step handlers are registered up front, per flow type, with a builder:
//!
//! ```rust,ignore
//! let counter = FlowType::<Counter>::new("counter")
//!     .step::<Inc, _, _>("Count", |mut flow, event, _| async move {
//!         flow.value += event.map_or(0, |inc| inc.0);
//!         Ok((flow, Transition::stay()))
//!     });
//! let registry = FlowRegistry::builder().add(counter).build();
//! ```
//!
//! # Dispatch
//!
//! | Situation                              | Handler                    |
//! |----------------------------------------|----------------------------|
//! | current step registered, event accepted | the step                  |
//! | current step registered, event rejected | `UnsupportedEvent`        |
//! | current step not registered            | `NoStep`                   |
//!
//! System handlers are never themselves redirected: a custom
//! `UnsupportedEvent` or `NoStep` handler that rejects the event falls back
//! to the built-in behavior instead.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use tracing::warn;

use super::flow::{steps, Event, FlowState, StepContext, Transition};
use super::id::Symbol;
use crate::error::{Error, Result};

pub(crate) type StepFuture<F> = BoxFuture<'static, Result<(F, Transition)>>;
type Handler<F> = Arc<dyn Fn(F, Option<Event>, StepContext) -> StepFuture<F> + Send + Sync>;

struct StepDef<F> {
    accepts: fn(&Event) -> bool,
    handler: Handler<F>,
}

fn accepts_any(_: &Event) -> bool {
    true
}

fn accepts<E: Any>(event: &Event) -> bool {
    (**event).is::<E>()
}

/// The step table of one flow state type.
pub struct FlowType<F> {
    name: Symbol,
    steps: HashMap<Symbol, StepDef<F>>,
}

impl<F: FlowState> FlowType<F> {
    pub fn new(name: &str) -> Self {
        Self {
            name: Symbol::new(name),
            steps: HashMap::new(),
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    /// Register a step accepting events of type `E`.
    ///
    /// The handler gets `None` when the step runs without an event (after an
    /// immediate transition).
    pub fn step<E, H, Fut>(mut self, name: &str, handler: H) -> Self
    where
        E: Any + Send + Sync,
        H: Fn(F, Option<Arc<E>>, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(F, Transition)>> + Send + 'static,
    {
        let erased: Handler<F> = Arc::new(move |flow: F, event: Option<Event>, ctx: StepContext| {
            let event = event.and_then(|event| event.downcast::<E>().ok());
            handler(flow, event, ctx).boxed()
        });
        self.steps.insert(
            Symbol::new(name),
            StepDef {
                accepts: accepts::<E>,
                handler: erased,
            },
        );
        self
    }

    /// Register a step accepting any event.
    pub fn on_any<H, Fut>(mut self, name: &str, handler: H) -> Self
    where
        H: Fn(F, Option<Event>, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(F, Transition)>> + Send + 'static,
    {
        let erased: Handler<F> = Arc::new(move |flow: F, event: Option<Event>, ctx: StepContext| {
            handler(flow, event, ctx).boxed()
        });
        self.steps.insert(
            Symbol::new(name),
            StepDef {
                accepts: accepts_any,
                handler: erased,
            },
        );
        self
    }

    pub fn start<H, Fut>(self, handler: H) -> Self
    where
        H: Fn(F, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(F, Transition)>> + Send + 'static,
    {
        self.on_any(steps::START, move |flow, _, ctx| handler(flow, ctx))
    }

    /// Handle the `Error` step, entered through [`Transition::fail`]. Without
    /// a handler the flow just parks there.
    pub fn on_error<H, Fut>(self, handler: H) -> Self
    where
        H: Fn(F, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(F, Transition)>> + Send + 'static,
    {
        self.on_any(steps::ERROR, move |flow, _, ctx| handler(flow, ctx))
    }

    pub fn on_unsupported_event<H, Fut>(self, handler: H) -> Self
    where
        H: Fn(F, Option<Event>, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(F, Transition)>> + Send + 'static,
    {
        self.on_any(steps::UNSUPPORTED_EVENT, handler)
    }

    pub fn on_no_step<H, Fut>(self, handler: H) -> Self
    where
        H: Fn(F, Option<Event>, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(F, Transition)>> + Send + 'static,
    {
        self.on_any(steps::NO_STEP, handler)
    }

    pub(crate) fn dispatch(
        &self,
        flow: F,
        step: &Symbol,
        event: Option<Event>,
        ctx: StepContext,
    ) -> StepFuture<F> {
        let Some(def) = self.steps.get(step) else {
            if steps::is_system(step.as_str()) {
                return self.fallback(step.as_str(), flow, event, ctx);
            }
            return self.system(steps::NO_STEP, flow, event, ctx);
        };
        if let Some(event) = &event {
            if !(def.accepts)(event) {
                return self.system(steps::UNSUPPORTED_EVENT, flow, Some(event.clone()), ctx);
            }
        }
        (def.handler)(flow, event, ctx)
    }

    fn system(&self, name: &str, flow: F, event: Option<Event>, ctx: StepContext) -> StepFuture<F> {
        match self.steps.get(name) {
            Some(def) if event.as_ref().map_or(true, |event| (def.accepts)(event)) => {
                (def.handler)(flow, event, ctx)
            }
            _ => self.fallback(name, flow, event, ctx),
        }
    }

    fn fallback(&self, name: &str, flow: F, event: Option<Event>, ctx: StepContext) -> StepFuture<F> {
        match name {
            steps::UNSUPPORTED_EVENT => {
                warn!(flow = %ctx.id, step = %ctx.step, has_event = event.is_some(), "unsupported event");
                future::ready(Ok((flow, Transition::stay()))).boxed()
            }
            steps::NO_STEP => future::ready(Err(Error::UnknownStep {
                flow: self.name.to_string(),
                step: ctx.step.to_string(),
            }))
            .boxed(),
            _ => future::ready(Ok((flow, Transition::stay()))).boxed(),
        }
    }
}

/// A flow state value paired with its step table, with the type erased.
pub(crate) trait AnyFlow: Send + Sync {
    fn clone_box(&self) -> Box<dyn AnyFlow>;

    fn serialize(&self) -> Result<Vec<u8>>;

    fn handle(
        self: Box<Self>,
        step: &Symbol,
        event: Option<Event>,
        ctx: StepContext,
    ) -> BoxFuture<'static, Result<(Box<dyn AnyFlow>, Transition)>>;

    fn as_any(&self) -> &dyn Any;
}

struct FlowInstance<F> {
    flow_type: Arc<FlowType<F>>,
    state: F,
}

impl<F: FlowState> AnyFlow for FlowInstance<F> {
    fn clone_box(&self) -> Box<dyn AnyFlow> {
        Box::new(FlowInstance {
            flow_type: Arc::clone(&self.flow_type),
            state: self.state.clone(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(&self.state)?)
    }

    fn handle(
        self: Box<Self>,
        step: &Symbol,
        event: Option<Event>,
        ctx: StepContext,
    ) -> BoxFuture<'static, Result<(Box<dyn AnyFlow>, Transition)>> {
        let FlowInstance { flow_type, state } = *self;
        let step = flow_type.dispatch(state, step, event, ctx);
        async move {
            let (state, transition) = step.await?;
            let flow: Box<dyn AnyFlow> = Box::new(FlowInstance { flow_type, state });
            Ok((flow, transition))
        }
        .boxed()
    }

    fn as_any(&self) -> &dyn Any {
        &self.state
    }
}

pub(crate) trait AnyFlowType: Send + Sync {
    fn name(&self) -> &Symbol;

    fn create(&self) -> Box<dyn AnyFlow>;

    /// Rebuild a flow from stored bytes; `None` yields the default state.
    fn deserialize(&self, data: Option<&[u8]>) -> Result<Box<dyn AnyFlow>>;
}

struct RegisteredType<F>(Arc<FlowType<F>>);

impl<F: FlowState> AnyFlowType for RegisteredType<F> {
    fn name(&self) -> &Symbol {
        self.0.name()
    }

    fn create(&self) -> Box<dyn AnyFlow> {
        Box::new(FlowInstance {
            flow_type: Arc::clone(&self.0),
            state: F::default(),
        })
    }

    fn deserialize(&self, data: Option<&[u8]>) -> Result<Box<dyn AnyFlow>> {
        let state = match data {
            Some(bytes) => rmp_serde::from_slice::<F>(bytes)?,
            None => F::default(),
        };
        Ok(Box::new(FlowInstance {
            flow_type: Arc::clone(&self.0),
            state,
        }))
    }
}

/// All flow types known to a host, keyed by name.
pub struct FlowRegistry {
    types: HashMap<Symbol, Arc<dyn AnyFlowType>>,
}

impl FlowRegistry {
    pub fn builder() -> FlowRegistryBuilder {
        FlowRegistryBuilder {
            types: HashMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(&Symbol::new(name))
    }

    pub fn names(&self) -> Vec<Symbol> {
        let mut names: Vec<Symbol> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn get(&self, name: &Symbol) -> Result<&Arc<dyn AnyFlowType>> {
        self.types
            .get(name)
            .ok_or_else(|| Error::UnknownFlowType(name.to_string()))
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("types", &self.names())
            .finish()
    }
}

pub struct FlowRegistryBuilder {
    types: HashMap<Symbol, Arc<dyn AnyFlowType>>,
}

impl FlowRegistryBuilder {
    pub fn add<F: FlowState>(mut self, flow_type: FlowType<F>) -> Self {
        let name = flow_type.name().clone();
        self.types
            .insert(name, Arc::new(RegisteredType(Arc::new(flow_type))));
        self
    }

    pub fn build(self) -> Arc<FlowRegistry> {
        Arc::new(FlowRegistry { types: self.types })
    }
}
