use super::MemoryTransport;
use crate::library::communication::protocol::{
    ChannelId, DeliveryTag, Frame, LibraryError, RpcReply,
};
use crate::library::communication::transport::{
    BindingSpec, ConsumeSpec, Envelope, ExchangeSpec, FrameSource, LoginSpec, PublishSpec,
    QueueSpec, Transport,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Names of the transport calls made so far, shared with the test that inspects them
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    fn push(&self, call: &'static str) {
        self.0.lock().unwrap().push(call);
    }

    /// How often the named call was made
    pub fn count(&self, call: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| **c == call).count()
    }
}

/// [`MemoryTransport`] that logs every call and fails the ones it is told to
pub struct RecordingTransport {
    inner: MemoryTransport,
    calls: CallLog,
    failing: HashSet<&'static str>,
}

impl RecordingTransport {
    pub fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            calls: CallLog::default(),
            failing: HashSet::new(),
        }
    }

    /// Makes the named call fail with a socket error instead of reaching the broker
    pub fn failing(mut self, call: &'static str) -> Self {
        self.failing.insert(call);
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    fn enter(&self, call: &'static str) -> Result<(), LibraryError> {
        self.calls.push(call);

        if self.failing.contains(call) {
            Err(LibraryError::SocketError)
        } else {
            Ok(())
        }
    }

    fn reply(&self, call: &'static str) -> Option<RpcReply> {
        self.enter(call).err().map(RpcReply::LibraryException)
    }
}

#[async_trait]
impl FrameSource for RecordingTransport {
    async fn wait_frame(&self) -> Result<Frame, LibraryError> {
        self.enter("wait_frame")?;
        self.inner.wait_frame().await
    }

    async fn read_message(&self, channel: ChannelId) -> RpcReply {
        match self.reply("read_message") {
            Some(reply) => reply,
            None => self.inner.read_message(channel).await,
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn open_socket(&self, host: &str, port: u16) -> Result<(), LibraryError> {
        self.enter("open_socket")?;
        self.inner.open_socket(host, port).await
    }

    async fn login(&self, spec: &LoginSpec) -> RpcReply {
        match self.reply("login") {
            Some(reply) => reply,
            None => self.inner.login(spec).await,
        }
    }

    async fn channel_open(&self, channel: ChannelId) -> RpcReply {
        match self.reply("channel_open") {
            Some(reply) => reply,
            None => self.inner.channel_open(channel).await,
        }
    }

    async fn channel_close(&self, channel: ChannelId, code: u16) -> RpcReply {
        match self.reply("channel_close") {
            Some(reply) => reply,
            None => self.inner.channel_close(channel, code).await,
        }
    }

    async fn exchange_declare(&self, channel: ChannelId, spec: &ExchangeSpec) -> RpcReply {
        match self.reply("exchange_declare") {
            Some(reply) => reply,
            None => self.inner.exchange_declare(channel, spec).await,
        }
    }

    async fn exchange_delete(
        &self,
        channel: ChannelId,
        exchange: &str,
        if_unused: bool,
    ) -> RpcReply {
        match self.reply("exchange_delete") {
            Some(reply) => reply,
            None => self.inner.exchange_delete(channel, exchange, if_unused).await,
        }
    }

    async fn queue_declare(&self, channel: ChannelId, spec: &QueueSpec) -> RpcReply {
        match self.reply("queue_declare") {
            Some(reply) => reply,
            None => self.inner.queue_declare(channel, spec).await,
        }
    }

    async fn queue_delete(
        &self,
        channel: ChannelId,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> RpcReply {
        match self.reply("queue_delete") {
            Some(reply) => reply,
            None => {
                self.inner
                    .queue_delete(channel, queue, if_unused, if_empty)
                    .await
            }
        }
    }

    async fn queue_bind(&self, channel: ChannelId, spec: &BindingSpec) -> RpcReply {
        match self.reply("queue_bind") {
            Some(reply) => reply,
            None => self.inner.queue_bind(channel, spec).await,
        }
    }

    async fn queue_unbind(&self, channel: ChannelId, spec: &BindingSpec) -> RpcReply {
        match self.reply("queue_unbind") {
            Some(reply) => reply,
            None => self.inner.queue_unbind(channel, spec).await,
        }
    }

    async fn basic_qos(&self, channel: ChannelId, prefetch_count: u16) -> RpcReply {
        match self.reply("basic_qos") {
            Some(reply) => reply,
            None => self.inner.basic_qos(channel, prefetch_count).await,
        }
    }

    async fn basic_consume(&self, channel: ChannelId, spec: &ConsumeSpec) -> RpcReply {
        match self.reply("basic_consume") {
            Some(reply) => reply,
            None => self.inner.basic_consume(channel, spec).await,
        }
    }

    async fn basic_cancel(&self, channel: ChannelId, consumer_tag: &str) -> RpcReply {
        match self.reply("basic_cancel") {
            Some(reply) => reply,
            None => self.inner.basic_cancel(channel, consumer_tag).await,
        }
    }

    async fn basic_publish(
        &self,
        channel: ChannelId,
        spec: &PublishSpec,
        body: &[u8],
    ) -> Result<(), LibraryError> {
        self.enter("basic_publish")?;
        self.inner.basic_publish(channel, spec, body).await
    }

    async fn basic_ack(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), LibraryError> {
        self.enter("basic_ack")?;
        self.inner.basic_ack(channel, delivery_tag, multiple).await
    }

    async fn basic_reject(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), LibraryError> {
        self.enter("basic_reject")?;
        self.inner.basic_reject(channel, delivery_tag, requeue).await
    }

    async fn consume_message(&self, timeout: Option<Duration>) -> Result<Envelope, RpcReply> {
        if let Some(reply) = self.reply("consume_message") {
            return Err(reply);
        }
        self.inner.consume_message(timeout).await
    }

    async fn connection_close(&self, code: u16) -> RpcReply {
        match self.reply("connection_close") {
            Some(reply) => reply,
            None => self.inner.connection_close(code).await,
        }
    }
}
