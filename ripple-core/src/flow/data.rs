use serde::{Deserialize, Serialize};

use super::id::Symbol;

/// The persisted form of a flow: version, current step and the serialized
/// flow state. The bytes are opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowData {
    pub version: i64,
    pub step: Symbol,
    pub data: Option<Vec<u8>>,
}

impl FlowData {
    pub fn new(step: Symbol, data: Option<Vec<u8>>) -> Self {
        Self {
            version: 0,
            step,
            data,
        }
    }
}
