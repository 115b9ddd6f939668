//! Connection handshake.
//!
//! Both ends send a handshake as their first message and read the other's.
//! The handshake carries the sender's peer id, which lets the receiving side
//! detect that a reconnect landed on a different peer, and a version set.
//! Incompatible versions fail the connection for good.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Protocol versions per scope, e.g. `"ripple.rpc" => 1`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionSet(BTreeMap<String, u32>);

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, scope: impl Into<String>, version: u32) -> Self {
        self.0.insert(scope.into(), version);
        self
    }

    pub fn get(&self, scope: &str) -> Option<u32> {
        self.0.get(scope).copied()
    }

    /// Scopes present on both sides must agree; scopes known to one side
    /// only are ignored.
    pub fn check_compatible(&self, remote: &VersionSet) -> Result<()> {
        for (scope, version) in &self.0 {
            if let Some(remote_version) = remote.get(scope) {
                if remote_version != *version {
                    return Err(Error::VersionMismatch(format!(
                        "{scope}: local {version}, remote {remote_version}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for VersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (scope, version) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{scope}={version}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHandshake {
    pub peer_id: Uuid,
    pub versions: VersionSet,
    /// Counts successful handshakes of the sending peer.
    pub index: u32,
}
