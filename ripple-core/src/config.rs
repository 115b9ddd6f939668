//! Runtime settings.
//!
//! Every component takes a plain options struct. [`Settings`] bundles them
//! so a host can load one JSON document; missing fields keep their defaults.
//!
//! ```json
//! {
//!   "computed": { "auto_invalidation_delay": { "secs": 30, "nanos": 0 } },
//!   "peer": { "call_timeout": { "secs": 5, "nanos": 0 } },
//!   "flow": { "keep_alive_for": { "secs": 60, "nanos": 0 } }
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::computed::ComputedOptions;
use crate::error::Result;
use crate::flow::FlowOptions;
use crate::kvstore::KeyValueStoreOptions;
use crate::rpc::PeerOptions;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub computed: ComputedOptions,
    pub peer: PeerOptions,
    pub flow: FlowOptions,
    pub kv_store: KeyValueStoreOptions,
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(Settings::from_json("{}").unwrap(), Settings::default());
    }

    #[test]
    fn partial_documents_override_only_what_they_name() {
        let settings = Settings::from_json(
            r#"{ "flow": { "keep_alive_for": { "secs": 60, "nanos": 0 } },
                 "peer": { "call_timeout": { "secs": 5, "nanos": 0 } } }"#,
        )
        .unwrap();
        assert_eq!(settings.flow.keep_alive_for, Duration::from_secs(60));
        assert_eq!(settings.flow.graceful_dispose_delay, FlowOptions::default().graceful_dispose_delay);
        assert_eq!(settings.peer.call_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.kv_store, KeyValueStoreOptions::default());
    }

    #[test]
    fn settings_survive_a_json_round_trip() {
        let mut settings = Settings::default();
        settings.computed.auto_invalidation_delay = Some(Duration::from_millis(1500));
        let json = settings.to_json().unwrap();
        assert_eq!(Settings::from_json(&json).unwrap(), settings);
    }

    #[test]
    fn malformed_documents_are_codec_errors() {
        let error = Settings::from_json("{ not json").unwrap_err();
        assert_eq!(error.kind_name(), "Codec");
    }
}
