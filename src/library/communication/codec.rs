//! Serialization of message bodies
//!
//! [`BsonCodec`] produces compact, field-tagged binary documents and is used on the wire by
//! default. [`JsonCodec`] encodes the same structures as [`serde_json`] text which is handy
//! when inspecting queues by hand. Both ignore unknown fields and reject missing ones,
//! as long as the message types do not opt out via serde attributes.

use crate::library::BoxedError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Conversion between typed messages and raw bodies
pub trait Codec {
    /// Serializes a message
    fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, BoxedError>;

    /// Deserializes a message
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, BoxedError>;
}

/// Binary encoding provided by [`bson`]
#[derive(Debug, Clone, Copy, Default)]
pub struct BsonCodec;

impl Codec for BsonCodec {
    fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, BoxedError> {
        let document = bson::to_document(message)?;
        let mut body = Vec::new();
        document.to_writer(&mut body)?;
        Ok(body)
    }

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, BoxedError> {
        let mut reader = body;
        let document = bson::Document::from_reader(&mut reader)?;
        Ok(bson::from_document(document)?)
    }
}

/// Text encoding provided by [`serde_json`]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, BoxedError> {
        serde_json::to_vec(message).map_err(Into::into)
    }

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, BoxedError> {
        serde_json::from_slice(body).map_err(Into::into)
    }
}

/// Selectable message encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// [`BsonCodec`]
    Bson,
    /// [`JsonCodec`]
    Json,
}

impl Default for WireFormat {
    fn default() -> Self {
        WireFormat::Bson
    }
}

impl Codec for WireFormat {
    fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, BoxedError> {
        match self {
            WireFormat::Bson => BsonCodec.encode(message),
            WireFormat::Json => JsonCodec.encode(message),
        }
    }

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, BoxedError> {
        match self {
            WireFormat::Bson => BsonCodec.decode(body),
            WireFormat::Json => JsonCodec.decode(body),
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bson" => Ok(WireFormat::Bson),
            "json" => Ok(WireFormat::Json),
            other => Err(format!(
                "unknown wire format '{}', expected bson or json",
                other
            )),
        }
    }
}

impl Display for WireFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Bson => write!(f, "bson"),
            WireFormat::Json => write!(f, "json"),
        }
    }
}
