//! Broker capability consumed by the messaging layer
//!
//! [`Transport`] mirrors the connection level calls of an AMQP 0-9-1 client library and
//! reports every outcome as an [`RpcReply`] so that the [`validation`](super::validation)
//! rules apply uniformly. The parameter types describe entities independently of the library.

use super::protocol::{ChannelId, DeliveryTag, Frame, LibraryError, RpcReply};
use async_trait::async_trait;
use std::time::Duration;

/// Maximum number of channels requested during login
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

/// Maximum frame size requested during login
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Parameters for authenticating a connection and selecting a virtual host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSpec {
    /// Virtual host to open
    pub vhost: String,
    /// User name for SASL PLAIN
    pub login: String,
    /// Password for SASL PLAIN
    pub password: String,
    /// Heartbeat interval in seconds, zero disables heartbeats
    pub heartbeat: u16,
    /// Maximum number of channels
    pub channel_max: u16,
    /// Maximum frame size in bytes
    pub frame_max: u32,
}

/// Routing algorithm of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes by exact routing key match
    Direct,
    /// Routes to every bound queue
    Fanout,
}

impl ExchangeKind {
    /// Name of the exchange type on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Parameters of an `exchange.declare` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name
    pub name: String,
    /// Exchange type
    pub kind: ExchangeKind,
    /// Only check for existence instead of creating it
    pub passive: bool,
    /// Survive a broker restart
    pub durable: bool,
    /// Delete once the last binding is removed
    pub auto_delete: bool,
    /// Not publishable by clients
    pub internal: bool,
}

impl ExchangeSpec {
    /// Durable, auto-deleting direct exchange
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            passive: false,
            durable: true,
            auto_delete: true,
            internal: false,
        }
    }
}

/// Parameters of a `queue.declare` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Only check for existence instead of creating it
    pub passive: bool,
    /// Survive a broker restart
    pub durable: bool,
    /// Restrict access to the declaring connection
    pub exclusive: bool,
    /// Delete once the last consumer is gone
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Durable, shared, auto-deleting queue
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: true,
        }
    }
}

/// Parameters of a `queue.bind` or `queue.unbind` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    /// Queue to bind
    pub queue: String,
    /// Exchange to bind to
    pub exchange: String,
    /// Routing key to match
    pub routing_key: String,
}

/// Parameters of a `basic.consume` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeSpec {
    /// Queue to consume from
    pub queue: String,
    /// Consumer tag, the broker generates one when empty
    pub consumer_tag: String,
    /// Do not deliver messages published on the same connection
    pub no_local: bool,
    /// Deliveries count as acknowledged as soon as they are sent
    pub no_ack: bool,
    /// Refuse any other consumer on the queue
    pub exclusive: bool,
}

/// Parameters of a `basic.publish` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSpec {
    /// Exchange to publish to
    pub exchange: String,
    /// Routing key for the exchange
    pub routing_key: String,
    /// Return the message if it can not be routed
    pub mandatory: bool,
    /// Return the message if it can not be delivered right away
    pub immediate: bool,
}

/// A single delivered message
///
/// The envelope is exclusively owned by its receiver until it is handed back
/// to the connection for acknowledgement or rejection, which consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Channel the message was delivered on
    pub channel: ChannelId,
    /// Delivery tag for acknowledgement or rejection
    pub delivery_tag: DeliveryTag,
    /// Tag of the consumer that received the message
    pub consumer_tag: String,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Whether the message has been delivered before
    pub redelivered: bool,
    /// Raw message body
    pub body: Vec<u8>,
}

/// Raw access to the frame stream of a connection
///
/// Only needed to resynchronise after a consume call ran into a frame
/// that is not part of a delivery.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Blocks until the next frame arrives
    async fn wait_frame(&self) -> Result<Frame, LibraryError>;

    /// Reads and discards the content that follows a method frame on the given channel
    async fn read_message(&self, channel: ChannelId) -> RpcReply;
}

/// Connection level capability of an AMQP client library
///
/// Every instance represents exactly one broker connection. Implementations
/// are expected to be driven by one task at a time; the interior mutability
/// only exists so that derived resources can share a reference to it.
#[async_trait]
pub trait Transport: FrameSource {
    /// Opens the TCP socket
    async fn open_socket(&self, host: &str, port: u16) -> Result<(), LibraryError>;

    /// Authenticates and opens the virtual host
    async fn login(&self, spec: &LoginSpec) -> RpcReply;

    /// Opens a channel with the given identifier
    async fn channel_open(&self, channel: ChannelId) -> RpcReply;

    /// Closes a channel
    async fn channel_close(&self, channel: ChannelId, code: u16) -> RpcReply;

    /// Declares an exchange
    async fn exchange_declare(&self, channel: ChannelId, spec: &ExchangeSpec) -> RpcReply;

    /// Deletes an exchange
    async fn exchange_delete(
        &self,
        channel: ChannelId,
        exchange: &str,
        if_unused: bool,
    ) -> RpcReply;

    /// Declares a queue
    async fn queue_declare(&self, channel: ChannelId, spec: &QueueSpec) -> RpcReply;

    /// Deletes a queue
    async fn queue_delete(
        &self,
        channel: ChannelId,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> RpcReply;

    /// Binds a queue to an exchange
    async fn queue_bind(&self, channel: ChannelId, spec: &BindingSpec) -> RpcReply;

    /// Removes a binding
    async fn queue_unbind(&self, channel: ChannelId, spec: &BindingSpec) -> RpcReply;

    /// Limits the number of unacknowledged deliveries on a channel, zero lifts the limit
    async fn basic_qos(&self, channel: ChannelId, prefetch_count: u16) -> RpcReply;

    /// Registers a consumer
    async fn basic_consume(&self, channel: ChannelId, spec: &ConsumeSpec) -> RpcReply;

    /// Cancels a consumer, deliveries that have not been acknowledged stay pending
    async fn basic_cancel(&self, channel: ChannelId, consumer_tag: &str) -> RpcReply;

    /// Publishes a message
    async fn basic_publish(
        &self,
        channel: ChannelId,
        spec: &PublishSpec,
        body: &[u8],
    ) -> Result<(), LibraryError>;

    /// Acknowledges a delivery
    async fn basic_ack(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), LibraryError>;

    /// Rejects a delivery
    async fn basic_reject(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), LibraryError>;

    /// Waits for the next delivery on any channel of this connection
    ///
    /// Blocks indefinitely when no timeout is given. Expiry of the timeout is reported as
    /// [`LibraryError::Timeout`]. A frame that is not part of a delivery is left in
    /// the stream and reported as [`LibraryError::UnexpectedState`].
    async fn consume_message(&self, timeout: Option<Duration>) -> Result<Envelope, RpcReply>;

    /// Closes the connection
    async fn connection_close(&self, code: u16) -> RpcReply;
}
