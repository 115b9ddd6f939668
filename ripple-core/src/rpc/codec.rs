//! Message and Argument Codecs
//!
//! Two serialization formats are supported, picked per peer ref:
//!
//! | Format    | Message frame | Argument data          |
//! |-----------|---------------|------------------------|
//! | `msgpack` | binary        | `ArgumentData::Binary` |
//! | `json`    | text          | `ArgumentData::Text`   |
//!
//! Argument decoding follows the tag of the data rather than the peer's
//! format, so either side may answer in either encoding.
//!
//! Errors sent in `$sys.error` are polymorphic: the binary form carries the
//! error kind as a type ref ahead of the payload, the text form carries it as
//! a field.

use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::message::{ArgumentData, RpcMessage};
use super::peer_ref::SerializationFormat;
use super::type_ref::{read_type_ref, write_type_ref};
use crate::error::{Error, Result};

/// A serialized message, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

pub trait MessageCodec: Send + Sync + Debug {
    fn format(&self) -> SerializationFormat;

    fn encode(&self, message: &RpcMessage) -> Result<Frame>;

    fn decode(&self, frame: Frame) -> Result<RpcMessage>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl MessageCodec for MsgPackCodec {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::MsgPack
    }

    fn encode(&self, message: &RpcMessage) -> Result<Frame> {
        Ok(Frame::Binary(rmp_serde::to_vec_named(message)?))
    }

    fn decode(&self, frame: Frame) -> Result<RpcMessage> {
        match frame {
            Frame::Binary(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
            Frame::Text(_) => Err(Error::InvalidMessage(
                "text frame on a msgpack connection".to_string(),
            )),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }

    fn encode(&self, message: &RpcMessage) -> Result<Frame> {
        Ok(Frame::Text(serde_json::to_string(message)?))
    }

    fn decode(&self, frame: Frame) -> Result<RpcMessage> {
        match frame {
            Frame::Text(text) => Ok(serde_json::from_str(&text)?),
            Frame::Binary(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }
}

pub fn codec_for(format: SerializationFormat) -> Arc<dyn MessageCodec> {
    match format {
        SerializationFormat::MsgPack => Arc::new(MsgPackCodec),
        SerializationFormat::Json => Arc::new(JsonCodec),
    }
}

pub fn encode_args<A>(format: SerializationFormat, args: &A) -> Result<ArgumentData>
where
    A: Serialize + ?Sized,
{
    match format {
        SerializationFormat::MsgPack => Ok(ArgumentData::Binary(rmp_serde::to_vec_named(args)?)),
        SerializationFormat::Json => Ok(ArgumentData::Text(serde_json::to_string(args)?)),
    }
}

pub fn decode_args<A: DeserializeOwned>(data: &ArgumentData) -> Result<A> {
    match data {
        ArgumentData::Binary(bytes) => Ok(rmp_serde::from_slice(bytes)?),
        ArgumentData::Text(text) => Ok(serde_json::from_str(text)?),
    }
}

/// Error kind written as the null type ref.
const EXPECTED_ERROR_KIND: &str = "Remote";

#[derive(Debug, Serialize, Deserialize)]
struct WireError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    message: String,
    transient: bool,
}

pub fn encode_error(format: SerializationFormat, error: &Error) -> Result<ArgumentData> {
    let (message, transient) = match error {
        Error::Remote { message, transient } => (message.clone(), *transient),
        other => (other.to_string(), other.is_transient()),
    };
    match format {
        SerializationFormat::MsgPack => {
            let mut buffer = Vec::new();
            write_type_ref(&mut buffer, EXPECTED_ERROR_KIND, error.kind_name())?;
            let wire = WireError {
                kind: None,
                message,
                transient,
            };
            buffer.extend_from_slice(&rmp_serde::to_vec_named(&wire)?);
            Ok(ArgumentData::Binary(buffer))
        }
        SerializationFormat::Json => {
            let wire = WireError {
                kind: Some(error.kind_name().to_string()),
                message,
                transient,
            };
            Ok(ArgumentData::Text(serde_json::to_string(&wire)?))
        }
    }
}

pub fn decode_error(data: &ArgumentData) -> Result<Error> {
    match data {
        ArgumentData::Binary(bytes) => {
            let mut rest = bytes.as_slice();
            let kind = read_type_ref(&mut rest, EXPECTED_ERROR_KIND)?;
            let wire: WireError = rmp_serde::from_slice(rest)?;
            Ok(Error::from_wire(&kind, wire.message, wire.transient))
        }
        ArgumentData::Text(text) => {
            let wire: WireError = serde_json::from_str(text)?;
            let kind = wire.kind.as_deref().unwrap_or(EXPECTED_ERROR_KIND);
            Ok(Error::from_wire(kind, wire.message, wire.transient))
        }
    }
}
