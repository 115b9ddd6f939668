//! Transports
//!
//! A peer talks to the other end through an [`RpcConnection`]: a pair of
//! message channels. Whatever sits behind the channels (a WebSocket, an
//! in-memory link) is hidden behind the [`Connector`] trait, which the peer
//! calls every time it needs a new connection.
//!
//! - [`AcceptConnector`] hands server peers the connections accepted for
//!   their client.
//! - [`TestConnector`] links a client to one of several in-process servers
//!   and can drop, restore or re-route the link on demand.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::codec::codec_for;
use super::message::RpcMessage;
use super::peer_ref::PeerRef;
use super::server::RpcServer;
use crate::channel::{channel_pair, transform, ChannelEnd};
use crate::error::{Error, Result};

/// One live connection to a remote peer.
///
/// The connection is over once `rx` yields `None`.
pub struct RpcConnection {
    pub tx: mpsc::UnboundedSender<RpcMessage>,
    pub rx: mpsc::UnboundedReceiver<RpcMessage>,
    /// Describes the other end, for logs and peer state.
    pub host: String,
}

impl RpcConnection {
    pub fn new(end: ChannelEnd<RpcMessage>, host: impl Into<String>) -> Self {
        Self {
            tx: end.tx,
            rx: end.rx,
            host: host.into(),
        }
    }
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `peer_ref`. Must return promptly once `cancel`
    /// fires.
    async fn connect(&self, peer_ref: &PeerRef, cancel: &CancellationToken) -> Result<RpcConnection>;

    /// Listeners wait for the remote side to connect: no connect timeout or
    /// reconnect delay applies to them.
    fn is_listener(&self) -> bool {
        false
    }
}

/// Connections accepted by a server for one client, queued until the
/// server peer asks for its next connection.
pub struct AcceptConnector {
    tx: mpsc::UnboundedSender<RpcConnection>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RpcConnection>>,
}

impl AcceptConnector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn push(&self, connection: RpcConnection) -> Result<()> {
        self.tx.send(connection).map_err(|_| Error::ChannelClosed)
    }
}

impl Default for AcceptConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for AcceptConnector {
    async fn connect(&self, peer_ref: &PeerRef, cancel: &CancellationToken) -> Result<RpcConnection> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::PeerStopped(peer_ref.to_string())),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::PeerStopped(peer_ref.to_string())),
            connection = rx.recv() => connection.ok_or(Error::ChannelClosed),
        }
    }

    fn is_listener(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkState {
    host_index: usize,
    connectable: bool,
}

/// In-process connector for tests.
///
/// Every message crossing the link goes through the wire codec of the
/// client's serialization format, so tests exercise encoding too.
pub struct TestConnector {
    client_id: Uuid,
    hosts: Vec<RpcServer>,
    state: watch::Sender<LinkState>,
    link: Mutex<Option<CancellationToken>>,
}

impl TestConnector {
    pub fn new(hosts: Vec<RpcServer>) -> Arc<Self> {
        Arc::new(Self {
            client_id: Uuid::new_v4(),
            hosts,
            state: watch::channel(LinkState {
                host_index: 0,
                connectable: true,
            })
            .0,
            link: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Drop the current link and refuse new ones until [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.state.send_modify(|state| state.connectable = false);
        self.drop_link();
    }

    /// Allow connections again.
    pub fn connect(&self) {
        self.state.send_modify(|state| state.connectable = true);
    }

    /// Drop the current link; the next connection attempt succeeds.
    pub fn reconnect(&self) {
        self.drop_link();
        self.connect();
    }

    /// Route future connections to host `index` and drop the current link.
    pub fn switch_host(&self, index: usize) {
        self.state.send_modify(|state| state.host_index = index);
        self.drop_link();
    }

    pub fn host_index(&self) -> usize {
        self.state.borrow().host_index
    }

    pub fn is_linked(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.is_cancelled())
    }

    fn drop_link(&self) {
        if let Some(link) = self.link.lock().take() {
            link.cancel();
        }
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, peer_ref: &PeerRef, cancel: &CancellationToken) -> Result<RpcConnection> {
        let mut state = self.state.subscribe();
        let host_index = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::PeerStopped(peer_ref.to_string())),
            ready = state.wait_for(|state| state.connectable) => {
                ready.map_err(|_| Error::ChannelClosed)?.host_index
            }
        };
        let server = self
            .hosts
            .get(host_index)
            .ok_or_else(|| Error::Disconnected(format!("no test host #{host_index}")))?;

        let (client_end, client_link) = channel_pair::<RpcMessage>();
        let (server_link, server_end) = channel_pair::<RpcMessage>();
        let link = CancellationToken::new();
        spawn_wire(client_link.rx, server_link.tx, peer_ref, link.clone());
        spawn_wire(server_link.rx, client_link.tx, peer_ref, link.clone());
        if let Some(previous) = self.link.lock().replace(link) {
            previous.cancel();
        }

        let client_id = self.client_id.to_string();
        let client_ref = PeerRef::remote(client_id.clone())
            .with_format(peer_ref.format)
            .to_server();
        server.accept(RpcConnection::new(server_end, client_id), client_ref)?;
        debug!(peer = %peer_ref, host = server.host(), "test link up");
        Ok(RpcConnection::new(client_end, server.host()))
    }
}

/// Copy messages through an encode/decode round trip until the link drops.
fn spawn_wire(
    rx: mpsc::UnboundedReceiver<RpcMessage>,
    tx: mpsc::UnboundedSender<RpcMessage>,
    peer_ref: &PeerRef,
    link: CancellationToken,
) {
    let codec = codec_for(peer_ref.format);
    tokio::spawn(async move {
        let wire = transform(rx, tx, move |message| codec.decode(codec.encode(&message)?));
        tokio::select! {
            _ = link.cancelled() => {}
            _ = wire => {}
        }
        link.cancel();
    });
}
