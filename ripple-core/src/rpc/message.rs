//! RPC wire messages.

use serde::{Deserialize, Serialize};

/// Call type of a regular request/response call.
pub const CALL_TYPE_PLAIN: u8 = 0;
/// Call type of a compute call: the result stays valid until the server
/// sends an invalidation.
pub const CALL_TYPE_COMPUTE: u8 = 1;
/// Call type of protocol-level messages (handshake, results, cancellation).
pub const CALL_TYPE_SYSTEM: u8 = 2;

/// Service name of system calls.
pub const SYSTEM_SERVICE: &str = "$sys";

/// System call method names.
pub mod system {
    pub const HANDSHAKE: &str = "handshake";
    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
    pub const CANCEL: &str = "cancel";
    pub const INVALIDATE: &str = "invalidate";
}

/// Encoded call arguments or result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgumentData {
    Text(String),
    Binary(Vec<u8>),
}

impl ArgumentData {
    pub fn empty() -> Self {
        ArgumentData::Binary(Vec::new())
    }

    pub fn len(&self) -> usize {
        match self {
            ArgumentData::Text(text) => text.len(),
            ArgumentData::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHeader {
    pub key: String,
    pub value: String,
}

impl RpcHeader {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub call_type_id: u8,
    /// The call id; for results and system calls, the id of the call they
    /// refer to.
    pub related_id: i64,
    pub service: String,
    pub method: String,
    pub argument_data: ArgumentData,
    #[serde(default)]
    pub headers: Vec<RpcHeader>,
}

impl RpcMessage {
    pub fn call(
        call_type_id: u8,
        id: i64,
        service: impl Into<String>,
        method: impl Into<String>,
        argument_data: ArgumentData,
    ) -> Self {
        Self {
            call_type_id,
            related_id: id,
            service: service.into(),
            method: method.into(),
            argument_data,
            headers: Vec::new(),
        }
    }

    pub fn system(method: &str, related_id: i64, argument_data: ArgumentData) -> Self {
        Self::call(CALL_TYPE_SYSTEM, related_id, SYSTEM_SERVICE, method, argument_data)
    }

    pub fn with_header(mut self, header: RpcHeader) -> Self {
        self.headers.push(header);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.key == key)
            .map(|header| header.value.as_str())
    }

    pub fn is_system(&self) -> bool {
        self.call_type_id == CALL_TYPE_SYSTEM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_looked_up_by_key() {
        let message = RpcMessage::call(CALL_TYPE_PLAIN, 7, "users", "get", ArgumentData::empty())
            .with_header(RpcHeader::new("trace", "abc"));
        assert_eq!(message.header("trace"), Some("abc"));
        assert_eq!(message.header("missing"), None);
        assert!(!message.is_system());
        assert!(RpcMessage::system(system::OK, 7, ArgumentData::empty()).is_system());
    }
}
