//! Connection to a real broker through the `amqprs` client library
//!
//! The library runs its own I/O tasks and hands over deliveries, returned messages and
//! broker initiated closes through callbacks. These end up in an [`Inbox`] from which
//! they are read back in order, so that the connection behaves like the frame stream the
//! [`Transport`] trait is modelled after. Errors of the library are turned back into
//! replies, recovering the broker's close status wherever it is known.

mod inbox;
mod reply;

use crate::library::communication::protocol::{
    reply_code, ChannelId, DeliveryTag, Frame, LibraryError, Method, ReplyStatus, RpcReply,
};
use crate::library::communication::transport::{
    BindingSpec, ConsumeSpec, Envelope, ExchangeSpec, FrameSource, LoginSpec, PublishSpec,
    QueueSpec, Transport,
};
use amqprs::channel::{
    BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicPublishArguments,
    BasicQosArguments, BasicRejectArguments, Channel, ConsumerMessage, ExchangeDeclareArguments,
    ExchangeDeleteArguments, QueueBindArguments, QueueDeclareArguments, QueueDeleteArguments,
    QueueUnbindArguments,
};
use amqprs::connection::{Connection, OpenConnectionArguments};
use amqprs::error::Error as AmqpError;
use amqprs::BasicProperties;
use async_trait::async_trait;
use inbox::{ChannelEvents, ConnectionEvents, Inbox};
use reply::{close_method, parse_status};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client connection to an AMQP 0-9-1 broker
///
/// Dropping the transport closes the connection in the background, provided a tokio
/// runtime is still around to do so.
#[derive(Default)]
pub struct AmqpTransport {
    target: Mutex<Option<(String, u16)>>,
    connection: Mutex<Option<Connection>>,
    channels: Mutex<HashMap<ChannelId, Arc<Channel>>>,
    inbox: Arc<Inbox>,
}

impl AmqpTransport {
    /// Creates a transport that is not yet connected
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates a failed synchronous call on the given channel into a reply
    fn failure(&self, channel: ChannelId, error: AmqpError) -> RpcReply {
        if let Some(status) = self.inbox.connection_close() {
            return RpcReply::ServerException(Method::ConnectionClose(status));
        }

        if let Some(status) = self.inbox.take_close(channel) {
            return RpcReply::ServerException(Method::ChannelClose(status));
        }

        if let AmqpError::NetworkError(reason) = &error {
            debug!(channel, %reason, "Connection to the broker failed");
            return RpcReply::LibraryException(LibraryError::SocketError);
        }

        match parse_status(&error.to_string()) {
            Some(status) => {
                let method = close_method(status);
                if matches!(method, Method::ChannelClose(_)) {
                    self.inbox.claim(channel);
                }
                RpcReply::ServerException(method)
            }
            None => {
                warn!(channel, %error, "Unable to interpret library error");
                RpcReply::LibraryException(LibraryError::BadAmqpData)
            }
        }
    }

    /// Translates a failed asynchronous call into a library error
    fn status_failure(&self, channel: ChannelId, error: AmqpError) -> Result<(), LibraryError> {
        if self.inbox.is_closed(channel) {
            // The close frame waits in the inbox and surfaces on the next consume
            return Ok(());
        }

        match error {
            AmqpError::NetworkError(reason) => {
                debug!(channel, %reason, "Connection to the broker failed");
                Err(LibraryError::SocketError)
            }
            error if self.inbox.connection_close().is_some() => {
                debug!(channel, %error, "Call on a closed connection");
                Err(LibraryError::ConnectionClosed)
            }
            error => {
                warn!(channel, %error, "Unable to interpret library error");
                Err(LibraryError::BadAmqpData)
            }
        }
    }

    /// Reply for calls on channels that were never opened or already closed
    fn unknown_channel(&self, channel: ChannelId) -> RpcReply {
        match self.inbox.connection_close() {
            Some(status) => RpcReply::ServerException(Method::ConnectionClose(status)),
            None => RpcReply::ServerException(Method::ChannelClose(ReplyStatus::new(
                reply_code::CHANNEL_ERROR,
                format!("CHANNEL_ERROR - unknown channel {}", channel),
            ))),
        }
    }

    async fn channel(&self, channel: ChannelId) -> Option<Arc<Channel>> {
        self.channels.lock().await.get(&channel).cloned()
    }

    /// Runs a synchronous call on an open channel
    async fn with_channel<'a, F, Fut, T>(&'a self, channel: ChannelId, call: F) -> RpcReply
    where
        F: FnOnce(Arc<Channel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>> + 'a,
    {
        let handle = match self.channel(channel).await {
            Some(handle) => handle,
            None => return self.unknown_channel(channel),
        };

        match call(handle).await {
            Ok(_) => RpcReply::Normal,
            Err(error) => self.failure(channel, error),
        }
    }

    /// Runs an asynchronous call on an open channel
    async fn with_channel_status<'a, F, Fut>(
        &'a self,
        channel: ChannelId,
        call: F,
    ) -> Result<(), LibraryError>
    where
        F: FnOnce(Arc<Channel>) -> Fut,
        Fut: Future<Output = Result<(), AmqpError>> + 'a,
    {
        let handle = match self.channel(channel).await {
            Some(handle) => handle,
            None if self.inbox.is_closed(channel) => return Ok(()),
            None => return Err(LibraryError::ConnectionClosed),
        };

        match call(handle).await {
            Ok(()) => Ok(()),
            Err(error) => self.status_failure(channel, error),
        }
    }
}

fn envelope(channel: ChannelId, message: ConsumerMessage) -> Option<Envelope> {
    let deliver = message.deliver?;

    Some(Envelope {
        channel,
        delivery_tag: deliver.delivery_tag(),
        consumer_tag: deliver.consumer_tag().to_string(),
        exchange: deliver.exchange().to_string(),
        routing_key: deliver.routing_key().to_string(),
        redelivered: deliver.redelivered(),
        body: message.content.unwrap_or_default(),
    })
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        let connection = match self.connection.get_mut().take() {
            Some(connection) => connection,
            None => return,
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = connection.close().await {
                        debug!(%error, "Unable to close dropped connection");
                    }
                });
            }
            Err(_) => warn!("Dropped open connection outside of a runtime"),
        }
    }
}

#[async_trait]
impl FrameSource for AmqpTransport {
    async fn wait_frame(&self) -> Result<Frame, LibraryError> {
        Ok(self.inbox.next_frame().await)
    }

    async fn read_message(&self, channel: ChannelId) -> RpcReply {
        self.inbox.read_message(channel)
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open_socket(&self, host: &str, port: u16) -> Result<(), LibraryError> {
        let mut addresses = lookup_host((host, port)).await.map_err(|error| {
            debug!(host, %error, "Unable to resolve broker address");
            LibraryError::HostnameResolutionFailed
        })?;

        if addresses.next().is_none() {
            return Err(LibraryError::HostnameResolutionFailed);
        }

        *self.target.lock().await = Some((host.to_owned(), port));
        Ok(())
    }

    async fn login(&self, spec: &LoginSpec) -> RpcReply {
        let (host, port) = match self.target.lock().await.clone() {
            Some(target) => target,
            None => return RpcReply::LibraryException(LibraryError::ConnectionClosed),
        };

        let mut arguments = OpenConnectionArguments::new(&host, port, &spec.login, &spec.password);
        arguments.virtual_host(&spec.vhost).heartbeat(spec.heartbeat);

        let connection = match Connection::open(&arguments).await {
            Ok(connection) => connection,
            Err(AmqpError::NetworkError(reason)) => {
                debug!(%host, port, %reason, "Unable to reach broker");
                return RpcReply::LibraryException(LibraryError::SocketError);
            }
            Err(error) => {
                return match parse_status(&error.to_string()) {
                    Some(status) => RpcReply::ServerException(Method::ConnectionClose(status)),
                    None => {
                        warn!(%host, port, %error, "Unable to open connection");
                        RpcReply::LibraryException(LibraryError::SocketError)
                    }
                }
            }
        };

        if let Err(error) = connection
            .register_callback(ConnectionEvents(self.inbox.clone()))
            .await
        {
            warn!(%error, "Unable to watch connection events");
        }

        info!(%host, port, vhost = %spec.vhost, "Connected to broker");
        *self.connection.lock().await = Some(connection);
        RpcReply::Normal
    }

    async fn channel_open(&self, channel: ChannelId) -> RpcReply {
        let opened = {
            let connection = self.connection.lock().await;
            match connection.as_ref() {
                Some(connection) => connection.open_channel(Some(channel)).await,
                None => return RpcReply::LibraryException(LibraryError::ConnectionClosed),
            }
        };

        let handle = match opened {
            Ok(handle) => handle,
            Err(error) => return self.failure(channel, error),
        };

        self.inbox.reset(channel);
        if let Err(error) = handle
            .register_callback(ChannelEvents(self.inbox.clone()))
            .await
        {
            return self.failure(channel, error);
        }

        self.channels.lock().await.insert(channel, Arc::new(handle));
        RpcReply::Normal
    }

    async fn channel_close(&self, channel: ChannelId, _code: u16) -> RpcReply {
        let handle = match self.channels.lock().await.remove(&channel) {
            Some(handle) => handle,
            None => return RpcReply::Normal,
        };

        if self.inbox.take_close(channel).is_some() {
            return RpcReply::Normal;
        }

        let handle = match Arc::try_unwrap(handle) {
            Ok(handle) => handle,
            Err(_) => {
                debug!(channel, "Channel still in use, leaving the close to the library");
                return RpcReply::Normal;
            }
        };

        match handle.close().await {
            Ok(()) => RpcReply::Normal,
            Err(error) => self.failure(channel, error),
        }
    }

    async fn exchange_declare(&self, channel: ChannelId, spec: &ExchangeSpec) -> RpcReply {
        let mut arguments = ExchangeDeclareArguments::new(&spec.name, spec.kind.as_str());
        arguments.passive = spec.passive;
        arguments.durable = spec.durable;
        arguments.auto_delete = spec.auto_delete;
        arguments.internal = spec.internal;

        self.with_channel(channel, |handle| async move {
            handle.exchange_declare(arguments).await
        })
        .await
    }

    async fn exchange_delete(
        &self,
        channel: ChannelId,
        exchange: &str,
        if_unused: bool,
    ) -> RpcReply {
        let mut arguments = ExchangeDeleteArguments::new(exchange);
        arguments.if_unused = if_unused;

        self.with_channel(channel, |handle| async move {
            handle.exchange_delete(arguments).await
        })
        .await
    }

    async fn queue_declare(&self, channel: ChannelId, spec: &QueueSpec) -> RpcReply {
        let mut arguments = QueueDeclareArguments::new(&spec.name);
        arguments.passive(spec.passive);
        arguments.durable(spec.durable);
        arguments.exclusive(spec.exclusive);
        arguments.auto_delete(spec.auto_delete);

        self.with_channel(channel, |handle| async move {
            handle.queue_declare(arguments).await
        })
        .await
    }

    async fn queue_delete(
        &self,
        channel: ChannelId,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> RpcReply {
        let mut arguments = QueueDeleteArguments::new(queue);
        arguments.if_unused = if_unused;
        arguments.if_empty = if_empty;

        self.with_channel(channel, |handle| async move {
            handle.queue_delete(arguments).await
        })
        .await
    }

    async fn queue_bind(&self, channel: ChannelId, spec: &BindingSpec) -> RpcReply {
        let arguments = QueueBindArguments::new(&spec.queue, &spec.exchange, &spec.routing_key);

        self.with_channel(channel, |handle| async move {
            handle.queue_bind(arguments).await
        })
        .await
    }

    async fn queue_unbind(&self, channel: ChannelId, spec: &BindingSpec) -> RpcReply {
        let arguments = QueueUnbindArguments::new(&spec.queue, &spec.exchange, &spec.routing_key);

        self.with_channel(channel, |handle| async move {
            handle.queue_unbind(arguments).await
        })
        .await
    }

    async fn basic_qos(&self, channel: ChannelId, prefetch_count: u16) -> RpcReply {
        let arguments = BasicQosArguments::new(0, prefetch_count, false);

        self.with_channel(channel, |handle| async move { handle.basic_qos(arguments).await })
            .await
    }

    async fn basic_consume(&self, channel: ChannelId, spec: &ConsumeSpec) -> RpcReply {
        let handle = match self.channel(channel).await {
            Some(handle) => handle,
            None => return self.unknown_channel(channel),
        };

        let mut arguments = BasicConsumeArguments::new(&spec.queue, &spec.consumer_tag);
        arguments.no_local = spec.no_local;
        arguments.no_ack = spec.no_ack;
        arguments.exclusive = spec.exclusive;

        let (tag, mut deliveries) = match handle.basic_consume_rx(arguments).await {
            Ok(consumer) => consumer,
            Err(error) => return self.failure(channel, error),
        };

        debug!(channel, %tag, queue = %spec.queue, "Consumer registered");
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            while let Some(message) = deliveries.recv().await {
                if let Some(envelope) = envelope(channel, message) {
                    inbox.deliver(envelope);
                }
            }
            debug!(channel, %tag, "Consumer stopped");
        });

        RpcReply::Normal
    }

    async fn basic_cancel(&self, channel: ChannelId, consumer_tag: &str) -> RpcReply {
        let arguments = BasicCancelArguments::new(consumer_tag);

        self.with_channel(channel, |handle| async move {
            handle.basic_cancel(arguments).await
        })
        .await
    }

    async fn basic_publish(
        &self,
        channel: ChannelId,
        spec: &PublishSpec,
        body: &[u8],
    ) -> Result<(), LibraryError> {
        let mut arguments = BasicPublishArguments::new(&spec.exchange, &spec.routing_key);
        arguments.mandatory = spec.mandatory;
        arguments.immediate = spec.immediate;
        let content = body.to_vec();

        self.with_channel_status(channel, |handle| async move {
            handle
                .basic_publish(BasicProperties::default(), content, arguments)
                .await
        })
        .await
    }

    async fn basic_ack(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), LibraryError> {
        let arguments = BasicAckArguments::new(delivery_tag, multiple);

        self.with_channel_status(channel, |handle| async move {
            handle.basic_ack(arguments).await
        })
        .await
    }

    async fn basic_reject(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), LibraryError> {
        let arguments = BasicRejectArguments::new(delivery_tag, requeue);

        self.with_channel_status(channel, |handle| async move {
            handle.basic_reject(arguments).await
        })
        .await
    }

    async fn consume_message(&self, timeout: Option<Duration>) -> Result<Envelope, RpcReply> {
        match self.connection.lock().await.as_ref() {
            Some(connection) if connection.is_open() => {}
            _ if self.inbox.connection_close().is_some() => {}
            _ => return Err(RpcReply::LibraryException(LibraryError::ConnectionClosed)),
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.inbox.next_delivery(deadline).await
    }

    async fn connection_close(&self, _code: u16) -> RpcReply {
        self.channels.lock().await.clear();

        let connection = match self.connection.lock().await.take() {
            Some(connection) => connection,
            None => return RpcReply::Normal,
        };

        if self.inbox.connection_close().is_some() {
            return RpcReply::Normal;
        }

        match connection.close().await {
            Ok(()) => RpcReply::Normal,
            Err(error) => self.failure(0, error),
        }
    }
}
