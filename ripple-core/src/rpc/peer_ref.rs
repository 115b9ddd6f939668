//! Peer References
//!
//! A peer ref names the other end of an RPC connection:
//!
//! ```text
//! remote.backend.server.msgpack://10.0.0.7:5000
//! ──┬─── ──┬──── ──┬─── ───┬─── ──────┬───────
//!   │      │       │       │          └ host info (opaque)
//!   │      │       │       └ serialization format
//!   │      │       └ optional: this end is the server
//!   │      └ optional: backend peer
//!   └ connection kind: remote | loopback | local | none
//! ```
//!
//! `Display` and `FromStr` round-trip.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Remote,
    Loopback,
    Local,
    None,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Remote => "remote",
            ConnectionKind::Loopback => "loopback",
            ConnectionKind::Local => "local",
            ConnectionKind::None => "none",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "remote" => Some(ConnectionKind::Remote),
            "loopback" => Some(ConnectionKind::Loopback),
            "local" => Some(ConnectionKind::Local),
            "none" => Some(ConnectionKind::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    Json,
    #[default]
    MsgPack,
}

impl SerializationFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SerializationFormat::Json => "json",
            SerializationFormat::MsgPack => "msgpack",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "json" => Some(SerializationFormat::Json),
            "msgpack" => Some(SerializationFormat::MsgPack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRef {
    pub kind: ConnectionKind,
    pub is_backend: bool,
    pub is_server: bool,
    pub format: SerializationFormat,
    pub host: String,
}

impl PeerRef {
    pub fn remote(host: impl Into<String>) -> Self {
        Self {
            kind: ConnectionKind::Remote,
            is_backend: false,
            is_server: false,
            format: SerializationFormat::default(),
            host: host.into(),
        }
    }

    pub fn loopback(host: impl Into<String>) -> Self {
        Self {
            kind: ConnectionKind::Loopback,
            ..Self::remote(host)
        }
    }

    pub fn local() -> Self {
        Self {
            kind: ConnectionKind::Local,
            ..Self::remote("")
        }
    }

    pub fn with_format(mut self, format: SerializationFormat) -> Self {
        self.format = format;
        self
    }

    pub fn backend(mut self) -> Self {
        self.is_backend = true;
        self
    }

    /// The server-side view of this client ref.
    pub fn to_server(&self) -> Self {
        Self {
            is_server: true,
            ..self.clone()
        }
    }

    /// Calls to a local peer are executed in-process, never sent.
    pub fn must_reroute_to_local(&self) -> bool {
        self.kind == ConnectionKind::Local
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if self.is_backend {
            f.write_str(".backend")?;
        }
        if self.is_server {
            f.write_str(".server")?;
        }
        write!(f, ".{}://{}", self.format.as_str(), self.host)
    }
}

impl FromStr for PeerRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidPeerRef(s.to_string());
        let (prefix, host) = s.split_once("://").ok_or_else(invalid)?;

        let mut tags: Vec<&str> = prefix.split('.').collect();
        let format = tags
            .pop()
            .and_then(SerializationFormat::parse)
            .ok_or_else(invalid)?;
        let mut tags = tags.into_iter();
        let kind = tags
            .next()
            .and_then(ConnectionKind::parse)
            .ok_or_else(invalid)?;

        let mut is_backend = false;
        let mut is_server = false;
        for tag in tags {
            match tag {
                "backend" if !is_backend && !is_server => is_backend = true,
                "server" if !is_server => is_server = true,
                _ => return Err(invalid()),
            }
        }

        Ok(Self {
            kind,
            is_backend,
            is_server,
            format,
            host: host.to_string(),
        })
    }
}

impl Serialize for PeerRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_all_parts() {
        let peer = PeerRef::remote("10.0.0.7:5000").backend().to_server();
        assert_eq!(peer.to_string(), "remote.backend.server.msgpack://10.0.0.7:5000");

        let peer = PeerRef::loopback("test").with_format(SerializationFormat::Json);
        assert_eq!(peer.to_string(), "loopback.json://test");
    }

    #[test]
    fn round_trips_through_strings() {
        for kind in [
            ConnectionKind::Remote,
            ConnectionKind::Loopback,
            ConnectionKind::Local,
            ConnectionKind::None,
        ] {
            for (is_backend, is_server) in [(false, false), (true, false), (false, true), (true, true)] {
                for format in [SerializationFormat::Json, SerializationFormat::MsgPack] {
                    let peer = PeerRef {
                        kind,
                        is_backend,
                        is_server,
                        format,
                        host: "host-1:80/path?x=.y".to_string(),
                    };
                    let parsed: PeerRef = peer.to_string().parse().unwrap();
                    assert_eq!(parsed, peer);
                }
            }
        }
    }

    #[test]
    fn rejects_malformed_refs() {
        for input in [
            "remote.msgpack",
            "remote.msgpack:/host",
            "remote://host",
            "bogus.msgpack://host",
            "remote.xml://host",
            "remote.server.backend.msgpack://host",
            "remote.extra.msgpack://host",
        ] {
            assert!(input.parse::<PeerRef>().is_err(), "{input} should be rejected");
        }
    }

    #[test]
    fn local_refs_reroute() {
        assert!(PeerRef::local().must_reroute_to_local());
        assert!(!PeerRef::remote("x").must_reroute_to_local());
    }
}
