//! RPC Server
//!
//! A server keeps one peer per client. A client that reconnects gets its
//! new connection routed to the same server peer, so calls the client made
//! to the server keep their state across reconnects.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::peer::{PeerOptions, RpcPeer};
use super::peer_ref::PeerRef;
use super::service::ServiceRegistry;
use super::transport::{AcceptConnector, RpcConnection};
use crate::error::{Error, Result};

struct ServerPeer {
    peer: RpcPeer,
    connector: Arc<AcceptConnector>,
}

struct ServerInner {
    host: String,
    services: Arc<ServiceRegistry>,
    options: PeerOptions,
    peers: DashMap<PeerRef, ServerPeer>,
    stopped: CancellationToken,
}

#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    pub fn new(host: impl Into<String>, services: Arc<ServiceRegistry>, options: PeerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                host: host.into(),
                services,
                options,
                peers: DashMap::new(),
                stopped: CancellationToken::new(),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.inner.services
    }

    /// Route `connection` to the server peer of `client_ref`, starting one
    /// if the client is new or its previous peer has stopped.
    pub fn accept(&self, connection: RpcConnection, client_ref: PeerRef) -> Result<RpcPeer> {
        if self.inner.stopped.is_cancelled() {
            return Err(Error::PeerStopped(self.inner.host.clone()));
        }
        let mut entry = self
            .inner
            .peers
            .entry(client_ref.clone())
            .or_insert_with(|| self.spawn_peer(client_ref.clone()));
        if entry.peer.is_stopped() {
            *entry = self.spawn_peer(client_ref);
        }
        entry.connector.push(connection)?;
        Ok(entry.peer.clone())
    }

    fn spawn_peer(&self, client_ref: PeerRef) -> ServerPeer {
        info!(host = %self.inner.host, client = %client_ref, "new client");
        let connector = Arc::new(AcceptConnector::new());
        let peer = RpcPeer::new(
            client_ref,
            connector.clone(),
            self.inner.services.clone(),
            self.inner.options.clone(),
        );
        peer.start();
        ServerPeer { peer, connector }
    }

    pub fn peer(&self, client_ref: &PeerRef) -> Option<RpcPeer> {
        self.inner.peers.get(client_ref).map(|entry| entry.peer.clone())
    }

    pub fn peers(&self) -> Vec<RpcPeer> {
        self.inner
            .peers
            .iter()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    /// Stop accepting connections and stop every server peer.
    pub async fn stop(&self) {
        self.inner.stopped.cancel();
        let peers: Vec<RpcPeer> = self
            .inner
            .peers
            .iter()
            .map(|entry| entry.peer.clone())
            .collect();
        self.inner.peers.clear();
        for peer in peers {
            peer.stop().await;
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("host", &self.inner.host)
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}
