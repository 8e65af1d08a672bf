//! Vocabulary shared between a [`Transport`](super::Transport) and the reply validation
//!
//! The types in here mirror what a C-level AMQP 0-9-1 client hands back after each call:
//! a structured RPC reply for synchronous methods, a plain status for asynchronous ones,
//! and raw frames when the caller has to resynchronise with the stream manually.

use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Identifier of a channel, unique only within its connection
pub type ChannelId = u16;

/// Per-channel handle used to acknowledge or reject a delivery
pub type DeliveryTag = u64;

/// Reply codes defined by the AMQP 0-9-1 specification that are relevant to this crate
pub mod reply_code {
    /// Normal completion
    pub const SUCCESS: u16 = 200;
    /// Mandatory message could not be routed to any queue
    pub const NO_ROUTE: u16 = 312;
    /// Insufficient permissions or failed authentication
    pub const ACCESS_REFUSED: u16 = 403;
    /// Entity does not exist
    pub const NOT_FOUND: u16 = 404;
    /// Exclusive entity is owned by another connection
    pub const RESOURCE_LOCKED: u16 = 405;
    /// Redeclaration with inequivalent arguments or a violated guard
    pub const PRECONDITION_FAILED: u16 = 406;
    /// Operation on a channel that is not open
    pub const CHANNEL_ERROR: u16 = 504;
    /// Operation not allowed in the current state
    pub const NOT_ALLOWED: u16 = 530;
}

/// Numeric AMQP method identifier (`class_id << 16 | method_id`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

impl MethodId {
    /// `connection.close`
    pub const CONNECTION_CLOSE: MethodId = MethodId(0x000A_0032);
    /// `channel.close`
    pub const CHANNEL_CLOSE: MethodId = MethodId(0x0014_0028);
    /// `basic.return`
    pub const BASIC_RETURN: MethodId = MethodId(0x003C_0032);
    /// `basic.deliver`
    pub const BASIC_DELIVER: MethodId = MethodId(0x003C_003C);
    /// `basic.ack`
    pub const BASIC_ACK: MethodId = MethodId(0x003C_0050);
}

impl Display for MethodId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Reply code and text attached to close and return methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyStatus {
    /// Numeric reply code, see [`reply_code`]
    pub code: u16,
    /// Human readable explanation supplied by the broker
    pub text: String,
}

impl ReplyStatus {
    /// Creates a new instance from raw parts
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

impl Display for ReplyStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Decoded method frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// The broker closes the whole connection
    ConnectionClose(ReplyStatus),
    /// The broker closes a single channel
    ChannelClose(ReplyStatus),
    /// A mandatory message came back undeliverable, its content follows
    BasicReturn {
        /// Why the message was returned
        status: ReplyStatus,
        /// Exchange the message was published to
        exchange: String,
        /// Routing key the message was published with
        routing_key: String,
    },
    /// A message is delivered to a consumer, its content follows
    BasicDeliver {
        /// Delivery tag on the receiving channel
        delivery_tag: DeliveryTag,
    },
    /// Publisher confirm
    BasicAck {
        /// Confirmed delivery tag
        delivery_tag: DeliveryTag,
        /// Whether all tags up to and including this one are confirmed
        multiple: bool,
    },
    /// Any method this crate does not decode
    Other(MethodId),
}

impl Method {
    /// Numeric identifier of the method
    pub fn id(&self) -> MethodId {
        match self {
            Method::ConnectionClose(_) => MethodId::CONNECTION_CLOSE,
            Method::ChannelClose(_) => MethodId::CHANNEL_CLOSE,
            Method::BasicReturn { .. } => MethodId::BASIC_RETURN,
            Method::BasicDeliver { .. } => MethodId::BASIC_DELIVER,
            Method::BasicAck { .. } => MethodId::BASIC_ACK,
            Method::Other(id) => *id,
        }
    }
}

/// Failure reported by the client library itself rather than the broker
///
/// The numeric codes follow the status values of the rabbitmq-c library.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LibraryError {
    /// Malformed data was received
    #[error("bad AMQP data")]
    BadAmqpData,
    /// Unknown method was received
    #[error("unknown AMQP method")]
    UnknownMethod,
    /// Host name could not be resolved
    #[error("hostname lookup failed")]
    HostnameResolutionFailed,
    /// Connection was closed
    #[error("connection closed unexpectedly")]
    ConnectionClosed,
    /// Low level socket failure
    #[error("a socket error occurred")]
    SocketError,
    /// Invalid argument passed to the library
    #[error("invalid parameter")]
    InvalidParameter,
    /// Operation did not complete within the given timeout
    #[error("operation timed out")]
    Timeout,
    /// No heartbeat was received within the negotiated interval
    #[error("a timeout occurred while waiting for a heartbeat")]
    HeartbeatTimeout,
    /// A frame arrived that does not fit the current state, e.g. a method where content was expected
    #[error("unexpected protocol state")]
    UnexpectedState,
}

impl LibraryError {
    /// Numeric status code of the library
    pub fn code(&self) -> i32 {
        match self {
            LibraryError::BadAmqpData => -0x0002,
            LibraryError::UnknownMethod => -0x0004,
            LibraryError::HostnameResolutionFailed => -0x0005,
            LibraryError::ConnectionClosed => -0x0007,
            LibraryError::SocketError => -0x0009,
            LibraryError::InvalidParameter => -0x000A,
            LibraryError::Timeout => -0x000D,
            LibraryError::HeartbeatTimeout => -0x000F,
            LibraryError::UnexpectedState => -0x0010,
        }
    }
}

/// Structured outcome of a synchronous broker call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    /// Call completed successfully
    Normal,
    /// The library did not record any reply
    None,
    /// The client library failed
    LibraryException(LibraryError),
    /// The broker answered with a close method
    ServerException(Method),
    /// Reply type that the library does not know about
    Unrecognized(i32),
}

impl RpcReply {
    /// Whether the call completed successfully
    pub fn is_normal(&self) -> bool {
        matches!(self, RpcReply::Normal)
    }
}

/// Payload of a raw frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// Method frame
    Method(Method),
    /// Content header frame
    Header {
        /// Size of the content body that follows
        body_size: u64,
    },
    /// Content body frame
    Body(Vec<u8>),
    /// Heartbeat frame
    Heartbeat,
}

/// Raw frame read from the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel the frame belongs to, zero for connection level frames
    pub channel: ChannelId,
    /// Decoded payload
    pub payload: FramePayload,
}

impl Frame {
    /// Creates a method frame on the given channel
    pub fn method(channel: ChannelId, method: Method) -> Self {
        Self {
            channel,
            payload: FramePayload::Method(method),
        }
    }
}
