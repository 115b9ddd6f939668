//! RPC with remote invalidation.
//!
//! Two peers exchange [`RpcMessage`]s over an [`RpcConnection`]. Besides
//! plain request/response calls, a peer can make *compute calls*: the server
//! answers with the output of one of its `Computed` nodes and later sends an
//! invalidation when that node is invalidated.
//!
//! ```text
//! client                                   server
//!   │ ── call (compute, id=7) ───────────────► │  get_or_produce(...)
//!   │ ◄───────────────────── $sys.ok (id=7) ── │
//!   │           ...                            │  node invalidated
//!   │ ◄───────────────── $sys.invalidate (7) ── │
//! ```
//!
//! [`RemoteComputeClient`] binds such calls to local `Computed` nodes, so
//! invalidation flows from a server's graph into its clients' graphs.

mod call;
mod client;
mod codec;
mod handshake;
mod message;
mod peer;
mod peer_ref;
mod server;
mod service;
mod transport;
mod type_ref;
mod websocket;

pub use call::{CallKind, CallStage};
pub use client::RemoteComputeClient;
pub use codec::{
    codec_for, decode_args, decode_error, encode_args, encode_error, Frame, JsonCodec,
    MessageCodec, MsgPackCodec,
};
pub use handshake::{RpcHandshake, VersionSet};
pub use message::{
    system, ArgumentData, RpcHeader, RpcMessage, CALL_TYPE_COMPUTE, CALL_TYPE_PLAIN,
    CALL_TYPE_SYSTEM, SYSTEM_SERVICE,
};
pub use peer::{OutboundComputeCall, PeerOptions, PeerState, RpcPeer, PROTOCOL_SCOPE, PROTOCOL_VERSION};
pub use peer_ref::{ConnectionKind, PeerRef, SerializationFormat};
pub use server::RpcServer;
pub use service::{InboundReply, MethodDef, MethodKind, ServiceRegistry, ServiceRegistryBuilder};
pub use transport::{AcceptConnector, Connector, RpcConnection, TestConnector};
pub use type_ref::{read_type_ref, type_hash, write_type_ref};
pub use websocket::{serve_websocket, WebSocketConnector, RPC_PATH};
