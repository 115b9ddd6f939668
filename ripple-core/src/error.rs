//! Error Types
//!
//! Every fallible operation in the crate returns [`Error`]. Errors fall into
//! three groups:
//!
//! ```text
//! Error
//! ├── transient   - ChannelClosed, ConnectTimeout, HandshakeTimeout,
//! │                 KeepAliveTimeout, Disconnected, CallTimeout
//! ├── terminal    - VersionMismatch, HandshakeFailed, MustRerouteToLocal,
//! │                 UnknownCallType, InvalidMessage, PeerStopped, ...
//! └── business    - Business, Remote
//! ```
//!
//! Transient errors are expected to be caught and retried (worker
//! re-acquisition, peer reconnect loop, computed reprocessing). Terminal errors
//! fail the call or the connection outright.
//!
//! Cancellation is not an error here: it is the `Cancelled` variant of
//! [`crate::Outcome`].
//!
//! `Error` is `Clone`; one captured error is observed by every dependent of a
//! failed computed and every caller awaiting a remote call.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The target queue/channel no longer accepts items.
    #[error("channel is closed")]
    ChannelClosed,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("keep-alive timed out")]
    KeepAliveTimeout,

    #[error("peer '{0}' is disconnected")]
    Disconnected(String),

    #[error("call timed out")]
    CallTimeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("incompatible versions: {0}")]
    VersionMismatch(String),

    #[error("call must be rerouted to the local service")]
    MustRerouteToLocal,

    #[error("unknown call type id: {0}")]
    UnknownCallType(u8),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("peer '{0}' is stopped")]
    PeerStopped(String),

    #[error("remote peer changed")]
    PeerChanged,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid peer ref '{0}'")]
    InvalidPeerRef(String),

    #[error("invalid type ref: {0}")]
    InvalidTypeRef(String),

    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("invalid flow id '{0}'")]
    InvalidFlowId(String),

    #[error("unknown flow type '{0}'")]
    UnknownFlowType(String),

    #[error("flow '{flow}' has no step '{step}'")]
    UnknownStep { flow: String, step: String },

    #[error("method '{service}.{method}' is not found")]
    UnknownMethod { service: String, method: String },

    /// An error that crossed the wire and has no local counterpart.
    #[error("{message}")]
    Remote { message: String, transient: bool },

    /// A domain error raised by user code (a compute function, a flow step).
    #[error("{0}")]
    Business(Arc<dyn std::error::Error + Send + Sync>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a domain error.
    pub fn business<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Business(Arc::new(error))
    }

    /// Build a business error from a plain message.
    pub fn message(message: impl Into<String>) -> Self {
        Error::Business(Arc::new(MessageError(message.into())))
    }

    /// Whether calling code is expected to retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ChannelClosed
            | Error::ConnectTimeout
            | Error::HandshakeTimeout
            | Error::KeepAliveTimeout
            | Error::Disconnected(_)
            | Error::CallTimeout => true,
            Error::Remote { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Stable variant name, used as the wire tag of serialized errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::ChannelClosed => "ChannelClosed",
            Error::ConnectTimeout => "ConnectTimeout",
            Error::HandshakeTimeout => "HandshakeTimeout",
            Error::KeepAliveTimeout => "KeepAliveTimeout",
            Error::Disconnected(_) => "Disconnected",
            Error::CallTimeout => "CallTimeout",
            Error::HandshakeFailed(_) => "HandshakeFailed",
            Error::VersionMismatch(_) => "VersionMismatch",
            Error::MustRerouteToLocal => "MustRerouteToLocal",
            Error::UnknownCallType(_) => "UnknownCallType",
            Error::InvalidMessage(_) => "InvalidMessage",
            Error::PeerStopped(_) => "PeerStopped",
            Error::PeerChanged => "PeerChanged",
            Error::Codec(_) => "Codec",
            Error::InvalidPeerRef(_) => "InvalidPeerRef",
            Error::InvalidTypeRef(_) => "InvalidTypeRef",
            Error::VersionConflict { .. } => "VersionConflict",
            Error::InvalidFlowId(_) => "InvalidFlowId",
            Error::UnknownFlowType(_) => "UnknownFlowType",
            Error::UnknownStep { .. } => "UnknownStep",
            Error::UnknownMethod { .. } => "UnknownMethod",
            Error::Remote { .. } => "Remote",
            Error::Business(_) => "Business",
            Error::Internal(_) => "Internal",
        }
    }

    /// Rebuild an error received from a remote peer.
    ///
    /// Unit-like variants are restored as-is; everything else becomes
    /// [`Error::Remote`] carrying the remote message.
    pub fn from_wire(kind: &str, message: String, transient: bool) -> Self {
        match kind {
            "ChannelClosed" => Error::ChannelClosed,
            "ConnectTimeout" => Error::ConnectTimeout,
            "HandshakeTimeout" => Error::HandshakeTimeout,
            "KeepAliveTimeout" => Error::KeepAliveTimeout,
            "CallTimeout" => Error::CallTimeout,
            "MustRerouteToLocal" => Error::MustRerouteToLocal,
            "PeerChanged" => Error::PeerChanged,
            _ => Error::Remote { message, transient },
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(error: rmp_serde::encode::Error) -> Self {
        Error::Codec(error.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(error: rmp_serde::decode::Error) -> Self {
        Error::Codec(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Codec(error.to_string())
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);
