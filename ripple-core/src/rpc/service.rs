//! Service Registry
//!
//! Maps `(service, method)` to a handler. Handlers are registered once at
//! startup through [`ServiceRegistryBuilder`] and are immutable afterwards.
//!
//! Two kinds of methods exist:
//!
//! - **plain**: run the handler, send its result.
//! - **compute**: run the handler to get a [`Computed`], send its output,
//!   then keep watching it and tell the caller when it is invalidated.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::codec::{decode_args, encode_args};
use super::message::ArgumentData;
use super::peer_ref::SerializationFormat;
use crate::computed::Computed;
use crate::error::{Error, Result};
use crate::outcome::{Cancelled, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Plain,
    Compute,
}

/// What an inbound call produced.
pub struct InboundReply {
    pub output: Outcome<ArgumentData>,
    /// Resolves when the output stops being valid (compute methods only).
    pub invalidated: Option<BoxFuture<'static, ()>>,
}

type Handler = Arc<
    dyn Fn(ArgumentData, SerializationFormat, CancellationToken) -> BoxFuture<'static, InboundReply>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct MethodDef {
    kind: MethodKind,
    handler: Handler,
}

impl MethodDef {
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn invoke(
        &self,
        args: ArgumentData,
        format: SerializationFormat,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, InboundReply> {
        (self.handler)(args, format, cancel)
    }
}

#[derive(Clone, Default)]
pub struct ServiceRegistry {
    methods: IndexMap<(String, String), MethodDef>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::default()
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn find(&self, service: &str, method: &str) -> Option<&MethodDef> {
        self.methods.get(&(service.to_string(), method.to_string()))
    }

    /// Registered `(service, method)` pairs in registration order.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &str, MethodKind)> {
        self.methods
            .iter()
            .map(|((service, method), def)| (service.as_str(), method.as_str(), def.kind))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[derive(Default)]
pub struct ServiceRegistryBuilder {
    methods: IndexMap<(String, String), MethodDef>,
}

impl ServiceRegistryBuilder {
    /// Register a plain method.
    pub fn plain<A, R, F, Fut>(self, service: &str, method: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(
            move |data: ArgumentData, format: SerializationFormat, cancel: CancellationToken| {
                let f = Arc::clone(&f);
                async move {
                    let output = match decode_args::<A>(&data) {
                        Ok(args) => (*f)(args, cancel)
                            .await
                            .and_then(|result| encode_args(format, &result)),
                        Err(error) => Err(error),
                    };
                    InboundReply {
                        output: output.into(),
                        invalidated: None,
                    }
                }
                .boxed()
            },
        );
        self.add(service, method, MethodKind::Plain, handler)
    }

    /// Register a compute method. `f` returns the server-side `Computed`
    /// whose output is sent and whose invalidation is forwarded.
    pub fn compute<A, R, F, Fut>(self, service: &str, method: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Clone + Send + Sync + 'static,
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Computed<R>, Cancelled>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(
            move |data: ArgumentData, format: SerializationFormat, cancel: CancellationToken| {
                let f = Arc::clone(&f);
                async move {
                    let args = match decode_args::<A>(&data) {
                        Ok(args) => args,
                        Err(error) => {
                            return InboundReply {
                                output: Outcome::Err(error),
                                invalidated: None,
                            }
                        }
                    };
                    match (*f)(args, cancel).await {
                        Ok(computed) => {
                            let output = computed
                                .output()
                                .and_then(|value| encode_args(format, &value));
                            let invalidated = async move { computed.when_invalidated().await }.boxed();
                            InboundReply {
                                output: output.into(),
                                invalidated: Some(invalidated),
                            }
                        }
                        Err(Cancelled) => InboundReply {
                            output: Outcome::Cancelled,
                            invalidated: None,
                        },
                    }
                }
                .boxed()
            },
        );
        self.add(service, method, MethodKind::Compute, handler)
    }

    fn add(mut self, service: &str, method: &str, kind: MethodKind, handler: Handler) -> Self {
        self.methods
            .insert((service.to_string(), method.to_string()), MethodDef { kind, handler });
        self
    }

    pub fn build(self) -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry {
            methods: self.methods,
        })
    }
}

/// The error sent back for a call to an unregistered method.
pub(crate) fn unknown_method(service: &str, method: &str) -> Error {
    Error::UnknownMethod {
        service: service.to_string(),
        method: method.to_string(),
    }
}
