//! Remote compute client: turns remote compute calls into local `Computed`
//! nodes.
//!
//! The node produced for a call is invalidated when the server invalidates
//! the call (or the peer reconnects or stops), and abandoning the node
//! abandons the call. Local nodes that read a remote value through a
//! producing context therefore get invalidated across the network.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::peer::RpcPeer;
use crate::computed::{ComputeContext, Computed, ComputedInput, Engine};
use crate::error::Error;
use crate::outcome::{Cancelled, Outcome};

#[derive(Clone, Debug)]
pub struct RemoteComputeClient {
    peer: RpcPeer,
    engine: Engine,
}

impl RemoteComputeClient {
    pub fn new(peer: RpcPeer, engine: Engine) -> Self {
        Self { peer, engine }
    }

    pub fn peer(&self) -> &RpcPeer {
        &self.peer
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Cache key of a remote method call.
    pub fn input<A>(service: &str, method: &str, args: &A) -> crate::Result<ComputedInput>
    where
        A: Serialize + ?Sized,
    {
        ComputedInput::new(&format!("{service}.{method}"), args)
    }

    /// The local node mirroring `service.method(args)` on the remote peer.
    ///
    /// A call lost to a disconnect before its result arrived fails with a
    /// transient error, which the engine's reprocessing policy retries.
    pub async fn get<A, R>(
        &self,
        context: &ComputeContext,
        service: &str,
        method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Outcome<Computed<R>>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let input = match Self::input(service, method, args) {
            Ok(input) => input,
            Err(error) => return Outcome::Err(error),
        };
        let peer = &self.peer;
        let produced = self
            .engine
            .get_or_produce(input, context, cancel, |producing| async move {
                let call = match peer.call_compute::<A, R>(service, method, args, cancel).await {
                    Outcome::Ok(call) => call,
                    Outcome::Err(error) => return Err(error),
                    Outcome::Cancelled => {
                        return Err(Error::Internal("remote call cancelled".to_string()))
                    }
                };
                if let Some(node) = producing.dependant() {
                    let watched = call.clone();
                    let invalidated = node.clone();
                    tokio::spawn(async move {
                        watched.when_invalidated().await;
                        debug!(call = watched.id(), "remote value invalidated");
                        invalidated.invalidate();
                    });
                    let abandoned = call.clone();
                    node.on_invalidated(move || abandoned.abandon());
                }
                call.result()
            })
            .await;
        match produced {
            Ok(computed) => Outcome::Ok(computed),
            Err(Cancelled) => Outcome::Cancelled,
        }
    }

    /// Like [`get`](Self::get), returning the value.
    pub async fn call<A, R>(
        &self,
        context: &ComputeContext,
        service: &str,
        method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Outcome<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.get::<A, R>(context, service, method, args, cancel)
            .await
            .and_then(|computed| computed.output().into())
    }
}
