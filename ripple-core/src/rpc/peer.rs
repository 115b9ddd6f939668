//! RPC Peer
//!
//! An [`RpcPeer`] owns one logical connection to another process: it keeps
//! reconnecting while it runs, tracks outbound calls across connections and
//! serves inbound calls from its [`ServiceRegistry`].
//!
//! # Lifecycle
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//!  Disconnected ──► Connecting ──► Connected ──► (connection lost)
//!            │           │
//!            └───────────┴──► Stopped   (stop(), version mismatch)
//! ```
//!
//! Each successful connection gets a new epoch number. Losing a connection
//! fails the calls sent on it that have no result yet; compute calls that
//! already hold a result survive. A successful reconnect (to the same host
//! or another one) invalidates every compute call holding a result, because
//! invalidations sent while the link was down are lost. Stopping the peer
//! invalidates or fails everything still registered.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::call::{CallEntry, CallKind, CallStage, InboundCallTable, OutboundCallTable};
use super::codec::{decode_args, decode_error, encode_args, encode_error};
use super::handshake::{RpcHandshake, VersionSet};
use super::message::{
    system, ArgumentData, RpcMessage, CALL_TYPE_COMPUTE, CALL_TYPE_PLAIN, CALL_TYPE_SYSTEM,
};
use super::peer_ref::{PeerRef, SerializationFormat};
use super::service::{unknown_method, ServiceRegistry};
use super::transport::{Connector, RpcConnection};
use crate::error::{Error, Result};
use crate::outcome::Outcome;
use crate::retry::RetryDelaySeq;

/// Version scope of the wire protocol itself.
pub const PROTOCOL_SCOPE: &str = "ripple.rpc";
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerOptions {
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Fails outbound calls that take longer, including time spent waiting
    /// for a connection.
    pub call_timeout: Option<Duration>,
    pub reconnect_delays: RetryDelaySeq,
    pub versions: VersionSet,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            call_timeout: None,
            reconnect_delays: RetryDelaySeq::exp(
                Duration::from_millis(250),
                Duration::from_secs(5),
            ),
            versions: VersionSet::new().with(PROTOCOL_SCOPE, PROTOCOL_VERSION),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerState {
    /// `try_index` counts failed attempts since the last connection.
    Disconnected { try_index: u32, error: Option<Error> },
    Connecting { try_index: u32 },
    Connected {
        remote_peer_id: Uuid,
        host: String,
        epoch: u64,
    },
    Stopped { error: Option<Error> },
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PeerState::Stopped { .. })
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Disconnected { try_index, .. } => write!(f, "disconnected (try #{try_index})"),
            PeerState::Connecting { try_index } => write!(f, "connecting (try #{try_index})"),
            PeerState::Connected { host, epoch, .. } => write!(f, "connected to {host} (#{epoch})"),
            PeerState::Stopped { .. } => f.write_str("stopped"),
        }
    }
}

/// The sender of the live connection, tagged with its epoch.
struct Link {
    epoch: u64,
    tx: mpsc::UnboundedSender<RpcMessage>,
}

pub(crate) struct PeerInner {
    peer_ref: PeerRef,
    id: Uuid,
    options: PeerOptions,
    connector: Arc<dyn Connector>,
    services: Arc<ServiceRegistry>,
    state: watch::Sender<PeerState>,
    link: Mutex<Option<Link>>,
    outbound: OutboundCallTable,
    inbound: InboundCallTable,
    next_call_id: AtomicI64,
    handshakes: AtomicU32,
    remote_peer_id: Mutex<Option<Uuid>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct RpcPeer {
    inner: Arc<PeerInner>,
}

impl RpcPeer {
    /// A peer that is not running yet; see [`start`](Self::start).
    pub fn new(
        peer_ref: PeerRef,
        connector: Arc<dyn Connector>,
        services: Arc<ServiceRegistry>,
        options: PeerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                peer_ref,
                id: Uuid::new_v4(),
                options,
                connector,
                services,
                state: watch::channel(PeerState::Disconnected {
                    try_index: 0,
                    error: None,
                })
                .0,
                link: Mutex::new(None),
                outbound: OutboundCallTable::default(),
                inbound: InboundCallTable::default(),
                next_call_id: AtomicI64::new(1),
                handshakes: AtomicU32::new(0),
                remote_peer_id: Mutex::new(None),
                stop: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Create and start a client peer.
    pub fn client(
        peer_ref: PeerRef,
        connector: Arc<dyn Connector>,
        services: Arc<ServiceRegistry>,
        options: PeerOptions,
    ) -> Self {
        let peer = Self::new(peer_ref, connector, services, options);
        peer.start();
        peer
    }

    /// Spawn the connection loop. Does nothing if it already runs.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() || self.inner.stop.is_cancelled() {
            return;
        }
        *task = Some(tokio::spawn(Arc::clone(&self.inner).run()));
    }

    pub fn peer_ref(&self) -> &PeerRef {
        &self.inner.peer_ref
    }

    /// This peer's id, sent in every handshake.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> PeerState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerState> {
        self.inner.state.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Wait for a connection. Fails once the peer is stopped.
    pub async fn when_connected(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let ready = state
            .wait_for(|state| state.is_connected() || state.is_stopped())
            .await
            .map_err(|_| self.inner.stopped_error())?;
        match &*ready {
            PeerState::Stopped { error } => {
                Err(error.clone().unwrap_or_else(|| self.inner.stopped_error()))
            }
            _ => Ok(()),
        }
    }

    /// Stop the peer and wait until every call it tracks is resolved.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        let task = self.inner.task.lock().take();
        match task {
            Some(task) => {
                if let Err(error) = task.await {
                    error!(peer = %self.inner.peer_ref, %error, "peer task failed");
                }
            }
            None => self.inner.shut_down(None),
        }
    }

    /// Outbound calls still registered: unanswered calls plus compute calls
    /// waiting for invalidation.
    pub fn outbound_call_count(&self) -> usize {
        self.inner.outbound.len()
    }

    pub fn inbound_call_count(&self) -> usize {
        self.inner.inbound.len()
    }

    /// Make a plain call.
    pub async fn call<A, R>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Outcome<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = match self.inner.encode_call_args(args) {
            Ok(data) => data,
            Err(error) => return Outcome::Err(error),
        };
        let entry = self.inner.register_call(CallKind::Plain, service, method);
        self.inner
            .run_call(&entry, data, cancel)
            .await
            .and_then(|data| decode_args(&data).into())
    }

    /// Make a compute call.
    ///
    /// Resolves once the server answers. A server-side error is a valid
    /// answer: it is returned inside the call, which stays subscribed to
    /// invalidation like any other result.
    pub async fn call_compute<A, R>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Outcome<OutboundComputeCall<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = match self.inner.encode_call_args(args) {
            Ok(data) => data,
            Err(error) => return Outcome::Err(error),
        };
        let entry = self.inner.register_call(CallKind::Compute, service, method);
        let outcome = self.inner.run_call(&entry, data, cancel).await;
        if outcome.is_cancelled() {
            if entry.invalidate(Error::message("cancelled")) {
                self.inner.outbound.remove(entry.id());
                self.inner
                    .send_system(system::CANCEL, entry.id(), ArgumentData::empty());
            }
            return Outcome::Cancelled;
        }
        if entry.is_answered() {
            return Outcome::Ok(OutboundComputeCall {
                entry,
                peer: Arc::downgrade(&self.inner),
                _output: PhantomData,
            });
        }
        match outcome {
            Outcome::Err(error) => Outcome::Err(error),
            _ => Outcome::Err(Error::Internal(format!(
                "compute call {} resolved without an answer",
                entry.id()
            ))),
        }
    }
}

impl fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcPeer")
            .field("ref", &self.inner.peer_ref.to_string())
            .field("state", &self.state().to_string())
            .finish()
    }
}

/// An answered compute call.
///
/// Its result stays valid until [`when_invalidated`](Self::when_invalidated)
/// resolves.
pub struct OutboundComputeCall<R> {
    entry: Arc<CallEntry>,
    peer: Weak<PeerInner>,
    _output: PhantomData<fn() -> R>,
}

impl<R> Clone for OutboundComputeCall<R> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
            peer: self.peer.clone(),
            _output: PhantomData,
        }
    }
}

impl<R: DeserializeOwned> OutboundComputeCall<R> {
    pub fn id(&self) -> i64 {
        self.entry.id()
    }

    pub fn stage(&self) -> CallStage {
        self.entry.stage()
    }

    pub fn result(&self) -> Result<R> {
        match self.entry.try_result() {
            Some(Outcome::Ok(data)) => decode_args(&data),
            Some(Outcome::Err(error)) => Err(error),
            Some(Outcome::Cancelled) | None => Err(Error::Internal(format!(
                "compute call {} has no result",
                self.entry.id()
            ))),
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.entry.is_invalidated()
    }

    pub async fn when_invalidated(&self) {
        self.entry.wait_invalidated().await
    }

    /// Stop tracking the call: invalidate it locally and tell the server to
    /// stop watching it.
    pub fn abandon(&self) {
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        if self.entry.invalidate(Error::message("abandoned")) {
            peer.outbound.remove(self.entry.id());
            peer.send_system(system::CANCEL, self.entry.id(), ArgumentData::empty());
        }
    }
}

impl<R> fmt::Debug for OutboundComputeCall<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundComputeCall")
            .field("id", &self.entry.id())
            .field("service", &self.entry.service())
            .field("method", &self.entry.method())
            .field("stage", &self.entry.stage())
            .finish()
    }
}

enum ConnectFailure {
    Stopped,
    Failed(Error),
}

impl PeerInner {
    fn stopped_error(&self) -> Error {
        Error::PeerStopped(self.peer_ref.to_string())
    }

    fn set_state(&self, state: PeerState) {
        debug!(peer = %self.peer_ref, state = %state, "peer state");
        self.state.send_replace(state);
    }

    fn encode_call_args<A: Serialize + ?Sized>(&self, args: &A) -> Result<ArgumentData> {
        if self.peer_ref.must_reroute_to_local() {
            return Err(Error::MustRerouteToLocal);
        }
        encode_args(self.peer_ref.format, args)
    }

    fn register_call(&self, kind: CallKind, service: &str, method: &str) -> Arc<CallEntry> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let entry = CallEntry::new(id, kind, service, method);
        self.outbound.register(Arc::clone(&entry));
        entry
    }

    /// Send the call once connected and wait for its result, honoring the
    /// caller's token and the call timeout.
    async fn run_call(
        &self,
        entry: &Arc<CallEntry>,
        data: ArgumentData,
        cancel: &CancellationToken,
    ) -> Outcome<ArgumentData> {
        let call_type = match entry.kind() {
            CallKind::Plain => CALL_TYPE_PLAIN,
            CallKind::Compute => CALL_TYPE_COMPUTE,
        };
        let message = RpcMessage::call(call_type, entry.id(), entry.service(), entry.method(), data);
        let exchange = async {
            if let Err(error) = self.send_when_connected(entry, message).await {
                self.abort_call(entry, Outcome::Err(error));
            }
            entry.wait_result().await
        };
        let timed = async {
            match self.options.call_timeout {
                Some(timeout) => tokio::time::timeout(timeout, exchange).await.ok(),
                None => Some(exchange.await),
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.abort_call(entry, Outcome::Cancelled);
                Outcome::Cancelled
            }
            outcome = timed => match outcome {
                Some(outcome) => outcome,
                None => {
                    debug!(peer = %self.peer_ref, call = entry.id(), "call timed out");
                    self.abort_call(entry, Outcome::Err(Error::CallTimeout));
                    entry.wait_result().await
                }
            },
        }
    }

    async fn send_when_connected(&self, entry: &CallEntry, message: RpcMessage) -> Result<()> {
        let mut state = self.state.subscribe();
        loop {
            if self.stop.is_cancelled() {
                return Err(self.stopped_error());
            }
            {
                let link = self.link.lock();
                if let Some(link) = link.as_ref() {
                    if link.tx.send(message.clone()).is_ok() {
                        entry.mark_sent(link.epoch);
                        return Ok(());
                    }
                }
            }
            if state.changed().await.is_err() {
                return Err(self.stopped_error());
            }
        }
    }

    /// Resolve a call locally and tell the server if it was already sent.
    fn abort_call(&self, entry: &CallEntry, outcome: Outcome<ArgumentData>) {
        let was_sent = entry.stage() == CallStage::Sent;
        if entry.fail(outcome) {
            self.outbound.remove(entry.id());
            if was_sent {
                self.send_system(system::CANCEL, entry.id(), ArgumentData::empty());
            }
        }
    }

    fn send_system(&self, method: &str, related_id: i64, data: ArgumentData) -> bool {
        match self.link.lock().as_ref() {
            Some(link) => link.tx.send(RpcMessage::system(method, related_id, data)).is_ok(),
            None => false,
        }
    }

    async fn run(self: Arc<Self>) {
        let mut try_index = 0u32;
        let mut epoch = 0u64;
        let final_error = loop {
            if self.stop.is_cancelled() {
                break None;
            }
            if try_index > 0 && !self.connector.is_listener() {
                let delay = self.options.reconnect_delays.delay(try_index - 1);
                warn!(peer = %self.peer_ref, attempt = try_index, ?delay, "reconnecting");
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(PeerState::Connecting { try_index });
            let (connection, handshake) = match self.connect().await {
                Ok(connected) => connected,
                Err(ConnectFailure::Stopped) => break None,
                Err(ConnectFailure::Failed(error)) if is_terminal(&error) => {
                    error!(peer = %self.peer_ref, %error, "connection failed for good");
                    break Some(error);
                }
                Err(ConnectFailure::Failed(error)) => {
                    try_index += 1;
                    debug!(peer = %self.peer_ref, %error, "connect failed");
                    self.set_state(PeerState::Disconnected {
                        try_index,
                        error: Some(error),
                    });
                    continue;
                }
            };

            epoch += 1;
            try_index = 0;
            let RpcConnection { tx, rx, host } = connection;
            let connection_cancel = self.stop.child_token();
            self.on_connected(&handshake, epoch, &host, tx.clone());

            let error = self.read_loop(rx, &tx, &connection_cancel).await;
            connection_cancel.cancel();
            self.on_disconnected(epoch);
            match error {
                None => break None,
                Some(error) => {
                    info!(peer = %self.peer_ref, %error, "disconnected");
                    self.set_state(PeerState::Disconnected {
                        try_index,
                        error: Some(error),
                    });
                }
            }
        };
        self.shut_down(final_error);
    }

    async fn connect(&self) -> std::result::Result<(RpcConnection, RpcHandshake), ConnectFailure> {
        let connecting = self.connector.connect(&self.peer_ref, &self.stop);
        let connection = if self.connector.is_listener() {
            connecting.await
        } else {
            tokio::time::timeout(self.options.connect_timeout, connecting)
                .await
                .unwrap_or(Err(Error::ConnectTimeout))
        };
        let mut connection = match connection {
            Ok(connection) => connection,
            Err(_) if self.stop.is_cancelled() => return Err(ConnectFailure::Stopped),
            Err(error) => return Err(ConnectFailure::Failed(error)),
        };

        let handshake = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Err(ConnectFailure::Stopped),
            handshake = tokio::time::timeout(
                self.options.handshake_timeout,
                self.handshake(&mut connection),
            ) => handshake.unwrap_or(Err(Error::HandshakeTimeout)),
        };
        match handshake {
            Ok(handshake) => Ok((connection, handshake)),
            Err(error) => Err(ConnectFailure::Failed(error)),
        }
    }

    async fn handshake(&self, connection: &mut RpcConnection) -> Result<RpcHandshake> {
        let ours = RpcHandshake {
            peer_id: self.id,
            versions: self.options.versions.clone(),
            index: self.handshakes.load(Ordering::Relaxed) + 1,
        };
        let data = encode_args(self.peer_ref.format, &ours)?;
        connection
            .tx
            .send(RpcMessage::system(system::HANDSHAKE, 0, data))
            .map_err(|_| Error::Disconnected(connection.host.clone()))?;

        let message = connection
            .rx
            .recv()
            .await
            .ok_or_else(|| Error::Disconnected(connection.host.clone()))?;
        if !(message.is_system() && message.method == system::HANDSHAKE) {
            return Err(Error::HandshakeFailed(format!(
                "expected a handshake, got {}.{}",
                message.service, message.method
            )));
        }
        let theirs: RpcHandshake = decode_args(&message.argument_data)
            .map_err(|error| Error::HandshakeFailed(error.to_string()))?;
        self.options.versions.check_compatible(&theirs.versions)?;
        self.handshakes.fetch_add(1, Ordering::Relaxed);
        Ok(theirs)
    }

    fn on_connected(
        &self,
        handshake: &RpcHandshake,
        epoch: u64,
        host: &str,
        tx: mpsc::UnboundedSender<RpcMessage>,
    ) {
        let previous = self.remote_peer_id.lock().replace(handshake.peer_id);
        let reason = match previous {
            Some(previous) if previous != handshake.peer_id => {
                info!(peer = %self.peer_ref, remote = %handshake.peer_id, "peer changed");
                Error::PeerChanged
            }
            _ => Error::Disconnected(self.peer_ref.to_string()),
        };
        // Invalidations sent while the link was down are lost.
        let invalidated = self.outbound.invalidate_received(&reason);
        if invalidated > 0 {
            debug!(peer = %self.peer_ref, count = invalidated, "invalidated compute calls on reconnect");
        }

        *self.link.lock() = Some(Link { epoch, tx });
        info!(peer = %self.peer_ref, host, epoch, "connected");
        self.set_state(PeerState::Connected {
            remote_peer_id: handshake.peer_id,
            host: host.to_string(),
            epoch,
        });
    }

    fn on_disconnected(&self, epoch: u64) {
        self.link.lock().take();
        let error = Error::Disconnected(self.peer_ref.to_string());
        let failed = self.outbound.fail_unanswered(epoch, &error);
        let cancelled = self.inbound.clear();
        debug!(peer = %self.peer_ref, failed, cancelled, "connection closed");
    }

    fn shut_down(&self, error: Option<Error>) {
        self.stop.cancel();
        // Keep the reason recorded by the first shutdown.
        if self.state.borrow().is_stopped() {
            return;
        }
        self.link.lock().take();
        let reason = error.clone().unwrap_or_else(|| self.stopped_error());
        let resolved = self.outbound.abort_all(&reason);
        self.inbound.clear();
        info!(peer = %self.peer_ref, resolved, "stopped");
        self.set_state(PeerState::Stopped { error });
    }

    /// Process messages until the connection drops (`Some`) or the peer
    /// stops (`None`).
    async fn read_loop(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<RpcMessage>,
        tx: &mpsc::UnboundedSender<RpcMessage>,
        connection_cancel: &CancellationToken,
    ) -> Option<Error> {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return None,
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                return Some(Error::Disconnected(self.peer_ref.to_string()));
            };
            if let Err(error) = self.process(message, tx, connection_cancel) {
                error!(peer = %self.peer_ref, %error, "failed to process message");
            }
        }
    }

    fn process(
        self: &Arc<Self>,
        message: RpcMessage,
        tx: &mpsc::UnboundedSender<RpcMessage>,
        connection_cancel: &CancellationToken,
    ) -> Result<()> {
        match message.call_type_id {
            CALL_TYPE_SYSTEM => self.process_system(message),
            CALL_TYPE_PLAIN | CALL_TYPE_COMPUTE => {
                self.serve(message, tx.clone(), connection_cancel.child_token());
                Ok(())
            }
            other => {
                let error = Error::UnknownCallType(other);
                let data = encode_error(self.peer_ref.format, &error)?;
                let _ = tx.send(RpcMessage::system(system::ERROR, message.related_id, data));
                Err(error)
            }
        }
    }

    fn process_system(&self, message: RpcMessage) -> Result<()> {
        let id = message.related_id;
        match message.method.as_str() {
            system::OK => self.accept_result(id, Outcome::Ok(message.argument_data)),
            system::ERROR => {
                let error = decode_error(&message.argument_data).unwrap_or_else(|error| error);
                self.accept_result(id, Outcome::Err(error));
            }
            system::CANCEL => {
                self.inbound.cancel(id);
            }
            system::INVALIDATE => {
                if let Some(entry) = self.outbound.remove(id) {
                    entry.invalidate(Error::message("invalidated before the result arrived"));
                    debug!(peer = %self.peer_ref, call = id, "compute call invalidated");
                }
            }
            other => {
                return Err(Error::InvalidMessage(format!("unexpected system call '{other}'")));
            }
        }
        Ok(())
    }

    fn accept_result(&self, id: i64, outcome: Outcome<ArgumentData>) {
        let Some(entry) = self.outbound.get(id) else {
            // Cancelled or timed out locally.
            return;
        };
        entry.set_remote_result(outcome);
        if entry.kind() == CallKind::Plain {
            self.outbound.remove(id);
        }
    }

    /// Run an inbound call on its own task.
    fn serve(
        self: &Arc<Self>,
        message: RpcMessage,
        tx: mpsc::UnboundedSender<RpcMessage>,
        cancel: CancellationToken,
    ) {
        let id = message.related_id;
        let format = self.peer_ref.format;
        let is_compute = message.call_type_id == CALL_TYPE_COMPUTE;
        let invoke = self
            .services
            .find(&message.service, &message.method)
            .map(|method| method.invoke(message.argument_data, format, cancel.clone()));
        let Some(invoke) = invoke else {
            let error = unknown_method(&message.service, &message.method);
            warn!(peer = %self.peer_ref, %error, "inbound call rejected");
            send_reply(&tx, format, id, Outcome::Err(error));
            if is_compute {
                let _ = tx.send(RpcMessage::system(system::INVALIDATE, id, ArgumentData::empty()));
            }
            return;
        };

        self.inbound.register(id, cancel.clone());
        let peer = Arc::downgrade(self);
        tokio::spawn(async move {
            let reply = invoke.await;
            if !reply.output.is_cancelled() {
                send_reply(&tx, format, id, reply.output);
                if is_compute {
                    match reply.invalidated {
                        Some(invalidated) => {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = invalidated => {
                                    let _ = tx.send(RpcMessage::system(
                                        system::INVALIDATE,
                                        id,
                                        ArgumentData::empty(),
                                    ));
                                }
                            }
                        }
                        // Nothing to watch: the result is stale right away.
                        None => {
                            let _ = tx.send(RpcMessage::system(
                                system::INVALIDATE,
                                id,
                                ArgumentData::empty(),
                            ));
                        }
                    }
                }
            }
            if let Some(peer) = peer.upgrade() {
                peer.inbound.remove(id);
            }
        });
    }
}

fn send_reply(
    tx: &mpsc::UnboundedSender<RpcMessage>,
    format: SerializationFormat,
    id: i64,
    output: Outcome<ArgumentData>,
) {
    let message = match output {
        Outcome::Ok(data) => RpcMessage::system(system::OK, id, data),
        Outcome::Err(error) => match encode_error(format, &error) {
            Ok(data) => RpcMessage::system(system::ERROR, id, data),
            Err(encode_failure) => {
                error!(call = id, error = %encode_failure, "failed to encode error reply");
                return;
            }
        },
        Outcome::Cancelled => return,
    };
    let _ = tx.send(message);
}

/// Errors that end the connection loop instead of triggering a reconnect.
fn is_terminal(error: &Error) -> bool {
    matches!(
        error,
        Error::VersionMismatch(_) | Error::HandshakeFailed(_) | Error::PeerStopped(_)
    )
}
