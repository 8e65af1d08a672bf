use super::broker::{ConnectionId, ConnectionState, Inbound, MemoryBroker};
use crate::library::communication::protocol::{
    ChannelId, DeliveryTag, Frame, LibraryError, Method, RpcReply,
};
use crate::library::communication::transport::{
    BindingSpec, ConsumeSpec, Envelope, ExchangeSpec, FrameSource, LoginSpec, PublishSpec,
    QueueSpec, Transport,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

enum Next<T> {
    Ready(T),
    Wait(Arc<Notify>),
}

/// Client connection to a [`MemoryBroker`]
///
/// Dropping the transport has the same effect as a lost TCP connection: channels are
/// closed and unacknowledged deliveries return to their queues.
pub struct MemoryTransport {
    broker: MemoryBroker,
    id: ConnectionId,
}

impl MemoryTransport {
    pub(super) fn new(broker: MemoryBroker, id: ConnectionId) -> Self {
        Self { broker, id }
    }

    /// Identifier of the connection on the broker, see [`MemoryBroker::inject_frame`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Repeatedly inspects the inbox until `take` yields a value or the deadline passes
    async fn next_inbound<T: Send>(
        &self,
        deadline: Option<Instant>,
        mut take: impl FnMut(&mut ConnectionState) -> Option<T> + Send,
    ) -> Result<T, LibraryError> {
        loop {
            let next = {
                let mut state = self.broker.lock();
                let connection = state
                    .connections
                    .get_mut(&self.id)
                    .ok_or(LibraryError::ConnectionClosed)?;

                match take(connection) {
                    Some(value) => Next::Ready(value),
                    None => Next::Wait(connection.notify.clone()),
                }
            };

            match next {
                Next::Ready(value) => return Ok(value),
                Next::Wait(notify) => match deadline {
                    Some(deadline) => {
                        if timeout_at(deadline, notify.notified()).await.is_err() {
                            return Err(LibraryError::Timeout);
                        }
                    }
                    None => notify.notified().await,
                },
            }
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.broker.lock().release_connection(self.id);
    }
}

#[async_trait]
impl FrameSource for MemoryTransport {
    async fn wait_frame(&self) -> Result<Frame, LibraryError> {
        self.next_inbound(None, |connection| {
            let frame = match connection.inbox.pop_front()? {
                Inbound::Frame(frame) => frame,
                Inbound::Delivery(envelope) => {
                    let frame = Frame::method(
                        envelope.channel,
                        Method::BasicDeliver {
                            delivery_tag: envelope.delivery_tag,
                        },
                    );
                    connection.pending_content = Some((envelope.channel, envelope.body));
                    frame
                }
                Inbound::Returned {
                    channel,
                    status,
                    exchange,
                    routing_key,
                    body,
                } => {
                    connection.pending_content = Some((channel, body));
                    Frame::method(
                        channel,
                        Method::BasicReturn {
                            status,
                            exchange,
                            routing_key,
                        },
                    )
                }
            };

            Some(frame)
        })
        .await
    }

    async fn read_message(&self, channel: ChannelId) -> RpcReply {
        let mut state = self.broker.lock();
        let connection = match state.connections.get_mut(&self.id) {
            Some(connection) => connection,
            None => return RpcReply::LibraryException(LibraryError::ConnectionClosed),
        };

        match connection.pending_content.take() {
            Some((pending, body)) if pending == channel => {
                trace!(channel, bytes = body.len(), "Discarded message content");
                RpcReply::Normal
            }
            other => {
                connection.pending_content = other;
                RpcReply::LibraryException(LibraryError::UnexpectedState)
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_socket(&self, host: &str, port: u16) -> Result<(), LibraryError> {
        self.broker.open_socket(self.id, host, port)
    }

    async fn login(&self, spec: &LoginSpec) -> RpcReply {
        self.broker.login(self.id, spec)
    }

    async fn channel_open(&self, channel: ChannelId) -> RpcReply {
        self.broker.channel_open(self.id, channel)
    }

    async fn channel_close(&self, channel: ChannelId, _code: u16) -> RpcReply {
        self.broker.channel_close(self.id, channel)
    }

    async fn exchange_declare(&self, channel: ChannelId, spec: &ExchangeSpec) -> RpcReply {
        self.broker.exchange_declare(self.id, channel, spec)
    }

    async fn exchange_delete(
        &self,
        channel: ChannelId,
        exchange: &str,
        if_unused: bool,
    ) -> RpcReply {
        self.broker
            .exchange_delete(self.id, channel, exchange, if_unused)
    }

    async fn queue_declare(&self, channel: ChannelId, spec: &QueueSpec) -> RpcReply {
        self.broker.queue_declare(self.id, channel, spec)
    }

    async fn queue_delete(
        &self,
        channel: ChannelId,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> RpcReply {
        self.broker
            .queue_delete(self.id, channel, queue, if_unused, if_empty)
    }

    async fn queue_bind(&self, channel: ChannelId, spec: &BindingSpec) -> RpcReply {
        self.broker.queue_bind(self.id, channel, spec)
    }

    async fn queue_unbind(&self, channel: ChannelId, spec: &BindingSpec) -> RpcReply {
        self.broker.queue_unbind(self.id, channel, spec)
    }

    async fn basic_qos(&self, channel: ChannelId, prefetch_count: u16) -> RpcReply {
        self.broker.basic_qos(self.id, channel, prefetch_count)
    }

    async fn basic_consume(&self, channel: ChannelId, spec: &ConsumeSpec) -> RpcReply {
        self.broker.basic_consume(self.id, channel, spec)
    }

    async fn basic_cancel(&self, channel: ChannelId, consumer_tag: &str) -> RpcReply {
        self.broker.basic_cancel(self.id, channel, consumer_tag)
    }

    async fn basic_publish(
        &self,
        channel: ChannelId,
        spec: &PublishSpec,
        body: &[u8],
    ) -> Result<(), LibraryError> {
        self.broker.basic_publish(self.id, channel, spec, body)
    }

    async fn basic_ack(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), LibraryError> {
        self.broker
            .basic_ack(self.id, channel, delivery_tag, multiple)
    }

    async fn basic_reject(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), LibraryError> {
        self.broker
            .basic_reject(self.id, channel, delivery_tag, requeue)
    }

    async fn consume_message(&self, timeout: Option<Duration>) -> Result<Envelope, RpcReply> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let next = self
            .next_inbound(deadline, |connection| {
                if !matches!(connection.inbox.front()?, Inbound::Delivery(_)) {
                    return Some(Err(LibraryError::UnexpectedState));
                }

                match connection.inbox.pop_front() {
                    Some(Inbound::Delivery(envelope)) => Some(Ok(envelope)),
                    _ => None,
                }
            })
            .await;

        match next {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(kind)) | Err(kind) => Err(RpcReply::LibraryException(kind)),
        }
    }

    async fn connection_close(&self, _code: u16) -> RpcReply {
        self.broker.connection_close(self.id)
    }
}
