use super::error::Error;
use super::protocol::{reply_code, ChannelId, LibraryError, Method, RpcReply};
use super::transport::{ConsumeSpec, Envelope, LoginSpec, PublishSpec, Transport};
use super::validation::{check_status, drain_after_consume, validate};
use super::warning::{Warning, WarningLog};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared between a [`Connection`] and the resources derived from it
pub(crate) struct Link {
    transport: Box<dyn Transport>,
}

impl Link {
    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}

/// Non-owning reference from a derived resource back to its connection
#[derive(Clone)]
pub(crate) struct BackRef {
    link: Weak<Link>,
    warnings: WarningLog,
}

impl BackRef {
    /// Resolves the connection, recording a [`Warning::StaleResource`] if it is gone
    pub(crate) fn upgrade(&self, resource: &str) -> Option<Arc<Link>> {
        let link = self.link.upgrade();

        if link.is_none() {
            self.warnings.record(Warning::StaleResource {
                resource: resource.to_owned(),
            });
        }

        link
    }

    /// Records a failed release without raising it
    pub(crate) fn teardown_failed(&self, resource: &str, error: &Error) {
        self.warnings.record(Warning::TeardownFailed {
            resource: resource.to_owned(),
            reason: error.to_string(),
        });
    }
}

/// Single session with a broker
///
/// The connection exclusively owns its [`Transport`]. Channels and topology entities
/// derived from it only keep a weak reference, so they can detect that the connection
/// is gone when they are released afterwards. Channel ids are allocated from a counter
/// that starts at 1 and is never reused within one connection.
pub struct Connection {
    link: Arc<Link>,
    warnings: WarningLog,
    next_channel: u32,
}

impl Connection {
    /// Wraps a fresh transport, warnings are appended to the given log
    pub fn new<T: Transport + 'static>(transport: T, warnings: WarningLog) -> Self {
        Self {
            link: Arc::new(Link {
                transport: Box::new(transport),
            }),
            warnings,
            next_channel: 1,
        }
    }

    /// Log receiving the warnings of this connection and its resources
    pub fn warnings(&self) -> &WarningLog {
        &self.warnings
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.link.transport()
    }

    pub(crate) fn backref(&self) -> BackRef {
        BackRef {
            link: Arc::downgrade(&self.link),
            warnings: self.warnings.clone(),
        }
    }

    /// Opens the socket to the broker
    pub async fn open_socket(&self, host: &str, port: u16) -> Result<(), Error> {
        let context = format!("failed to open socket to {}:{}", host, port);
        check_status(self.transport().open_socket(host, port).await, &context)?;

        info!(host, port, "Opened socket");
        Ok(())
    }

    /// Authenticates and opens the virtual host
    ///
    /// A refusal by the broker becomes [`Error::Auth`], library failures stay [`Error::Transport`].
    pub async fn login(&self, spec: &LoginSpec) -> Result<(), Error> {
        match self.transport().login(spec).await {
            RpcReply::ServerException(Method::ConnectionClose(status))
            | RpcReply::ServerException(Method::ChannelClose(status)) => {
                return Err(Error::Auth {
                    user: spec.login.clone(),
                    text: status.text,
                })
            }
            reply => validate(&reply, "login")?,
        }

        info!(user = %spec.login, vhost = %spec.vhost, "Logged in");
        Ok(())
    }

    /// Opens the next channel
    pub async fn open_channel(&mut self) -> Result<Channel, Error> {
        let id = match ChannelId::try_from(self.next_channel) {
            Ok(id) => id,
            Err(_) => {
                return Err(Error::Channel {
                    channel: ChannelId::MAX,
                    reason: "channel ids of this connection are exhausted".to_owned(),
                })
            }
        };
        self.next_channel += 1;

        let reply = self.transport().channel_open(id).await;
        validate(&reply, "channel.open").map_err(|error| Error::Channel {
            channel: id,
            reason: error.to_string(),
        })?;

        debug!(channel = id, "Opened channel");
        Ok(Channel {
            id,
            backref: self.backref(),
        })
    }

    /// Limits the unacknowledged deliveries on the given channel
    pub async fn qos(&self, channel: &Channel, prefetch_count: u16) -> Result<(), Error> {
        self.ensure_owned(channel)?;

        validate(
            &self.transport().basic_qos(channel.id, prefetch_count).await,
            "failed to set prefetch count",
        )?;

        debug!(channel = channel.id, prefetch_count, "Set prefetch count");
        Ok(())
    }

    /// Registers a consumer on the given channel
    pub async fn consume(&self, channel: &Channel, spec: &ConsumeSpec) -> Result<(), Error> {
        self.ensure_owned(channel)?;

        let context = format!("failed to consume from queue {}", spec.queue);
        validate(
            &self.transport().basic_consume(channel.id, spec).await,
            &context,
        )?;

        info!(
            channel = channel.id,
            queue = %spec.queue,
            tag = %spec.consumer_tag,
            "Started consuming"
        );
        Ok(())
    }

    /// Cancels a consumer registered on the given channel
    pub async fn cancel(&self, channel: &Channel, consumer_tag: &str) -> Result<(), Error> {
        self.ensure_owned(channel)?;

        let context = format!("failed to cancel consumer {}", consumer_tag);
        validate(
            &self.transport().basic_cancel(channel.id, consumer_tag).await,
            &context,
        )?;

        debug!(channel = channel.id, tag = consumer_tag, "Cancelled consumer");
        Ok(())
    }

    /// Publishes a message on the given channel
    pub async fn publish(
        &self,
        channel: &Channel,
        spec: &PublishSpec,
        body: &[u8],
    ) -> Result<(), Error> {
        self.ensure_owned(channel)?;

        let context = format!(
            "failed to publish to exchange {} with routing key {}",
            spec.exchange, spec.routing_key
        );
        check_status(
            self.transport().basic_publish(channel.id, spec, body).await,
            &context,
        )?;

        debug!(
            channel = channel.id,
            exchange = %spec.exchange,
            routing_key = %spec.routing_key,
            bytes = body.len(),
            "Published message"
        );
        Ok(())
    }

    /// Waits for the next delivery on any channel of this connection
    ///
    /// Without a timeout the call waits indefinitely. An expired timeout is not an error
    /// but yields `None`, as does an interruption by a frame that turned out to be harmless.
    /// Every invocation performs exactly one consume call on the transport.
    pub async fn consume_message(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, Error> {
        match self.transport().consume_message(timeout).await {
            Ok(envelope) => {
                debug!(
                    channel = envelope.channel,
                    delivery_tag = envelope.delivery_tag,
                    redelivered = envelope.redelivered,
                    "Received message"
                );
                Ok(Some(envelope))
            }
            Err(RpcReply::LibraryException(LibraryError::Timeout)) => {
                debug!(?timeout, "No message available");
                Ok(None)
            }
            Err(reply) => {
                drain_after_consume(
                    self.transport(),
                    reply,
                    "failed to consume message",
                    &self.warnings,
                )
                .await?;
                Ok(None)
            }
        }
    }

    /// Acknowledges a delivery, removing it from its queue for good
    pub async fn ack(&self, envelope: Envelope) -> Result<(), Error> {
        let context = format!("failed to acknowledge delivery {}", envelope.delivery_tag);
        check_status(
            self.transport()
                .basic_ack(envelope.channel, envelope.delivery_tag, false)
                .await,
            &context,
        )?;

        debug!(delivery_tag = envelope.delivery_tag, "Acknowledged message");
        Ok(())
    }

    /// Rejects a delivery, optionally putting it back into its queue
    pub async fn reject(&self, envelope: Envelope, requeue: bool) -> Result<(), Error> {
        let context = format!("failed to reject delivery {}", envelope.delivery_tag);
        check_status(
            self.transport()
                .basic_reject(envelope.channel, envelope.delivery_tag, requeue)
                .await,
            &context,
        )?;

        debug!(
            delivery_tag = envelope.delivery_tag,
            requeue, "Rejected message"
        );
        Ok(())
    }

    /// Closes the connection
    ///
    /// Resources that are released afterwards skip the broker and record a warning instead.
    pub async fn close(self) -> Result<(), Error> {
        let reply = self.transport().connection_close(reply_code::SUCCESS).await;
        validate(&reply, "failed to close connection")?;

        info!("Closed connection");
        Ok(())
    }

    fn ensure_owned(&self, channel: &Channel) -> Result<(), Error> {
        if std::ptr::eq(channel.backref.link.as_ptr(), Arc::as_ptr(&self.link)) {
            Ok(())
        } else {
            warn!(channel = channel.id, "Channel used with a foreign connection");
            Err(Error::Channel {
                channel: channel.id,
                reason: "channel belongs to a different connection".to_owned(),
            })
        }
    }
}

/// Logical lane on a [`Connection`]
pub struct Channel {
    id: ChannelId,
    backref: BackRef,
}

impl Channel {
    /// Identifier, unique within the owning connection
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn backref(&self) -> &BackRef {
        &self.backref
    }

    /// Closes the channel if its connection is still alive
    ///
    /// Failures are recorded as warnings instead of being raised.
    pub async fn release(self) {
        let resource = format!("channel {}", self.id);

        if let Some(link) = self.backref.upgrade(&resource) {
            let reply = link
                .transport()
                .channel_close(self.id, reply_code::SUCCESS)
                .await;

            match validate(&reply, "channel.close") {
                Ok(()) => debug!(channel = self.id, "Closed channel"),
                Err(error) => self.backref.teardown_failed(&resource, &error),
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::implementation::memory::{BrokerConfig, MemoryBroker};
    use crate::library::communication::transport::{
        ExchangeSpec, QueueSpec, BindingSpec, DEFAULT_CHANNEL_MAX, DEFAULT_FRAME_MAX,
    };
    use pretty_assertions::assert_eq;

    fn login_spec(login: &str, password: &str, vhost: &str) -> LoginSpec {
        LoginSpec {
            vhost: vhost.into(),
            login: login.into(),
            password: password.into(),
            heartbeat: 0,
            channel_max: DEFAULT_CHANNEL_MAX,
            frame_max: DEFAULT_FRAME_MAX,
        }
    }

    async fn connect(broker: &MemoryBroker) -> Connection {
        let connection = Connection::new(broker.transport(), WarningLog::default());
        connection.open_socket("localhost", 5672).await.unwrap();
        connection
            .login(&login_spec("guest", "guest", "/"))
            .await
            .unwrap();
        connection
    }

    #[tokio::test]
    async fn fail_on_unreachable_hosts() {
        let broker = MemoryBroker::default();
        let connection = Connection::new(broker.transport(), WarningLog::default());

        let result = connection.open_socket("elsewhere", 5672).await;

        assert!(matches!(
            result,
            Err(Error::Transport {
                kind: LibraryError::HostnameResolutionFailed,
                ..
            })
        ));
        assert!(matches!(
            connection.open_socket("localhost", 1).await,
            Err(Error::Transport {
                kind: LibraryError::SocketError,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn carry_broker_text_on_refused_login() {
        let broker = MemoryBroker::default();
        let connection = Connection::new(broker.transport(), WarningLog::default());
        connection.open_socket("localhost", 5672).await.unwrap();

        let result = connection
            .login(&login_spec("guest", "wrong", "/"))
            .await;

        match result {
            Err(Error::Auth { user, text }) => {
                assert_eq!(user, "guest");
                assert!(text.contains("ACCESS_REFUSED"));
            }
            other => panic!("unexpected login result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn fail_login_without_socket_as_transport_error() {
        let broker = MemoryBroker::default();
        let connection = Connection::new(broker.transport(), WarningLog::default());

        let result = connection
            .login(&login_spec("guest", "guest", "/"))
            .await;

        assert!(matches!(
            result,
            Err(Error::Transport {
                kind: LibraryError::ConnectionClosed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn refuse_unknown_vhosts() {
        let broker = MemoryBroker::default();
        let connection = Connection::new(broker.transport(), WarningLog::default());
        connection.open_socket("localhost", 5672).await.unwrap();

        let result = connection
            .login(&login_spec("guest", "guest", "/missing"))
            .await;

        assert!(matches!(result, Err(Error::Auth { .. })));
    }

    #[tokio::test]
    async fn allocate_channel_ids_from_one() {
        let broker = MemoryBroker::default();
        let mut first = connect(&broker).await;
        let mut second = connect(&broker).await;

        let a = first.open_channel().await.unwrap();
        let b = first.open_channel().await.unwrap();
        let c = second.open_channel().await.unwrap();

        assert_eq!((a.id(), b.id(), c.id()), (1, 2, 1));
    }

    #[tokio::test]
    async fn fail_channel_open_beyond_channel_max() {
        let broker = MemoryBroker::new(BrokerConfig {
            channel_max: 1,
            ..Default::default()
        });
        let mut connection = connect(&broker).await;

        connection.open_channel().await.unwrap();
        let result = connection.open_channel().await;

        assert!(matches!(result, Err(Error::Channel { channel: 2, .. })));
    }

    #[tokio::test]
    async fn refuse_foreign_channels() {
        let broker = MemoryBroker::default();
        let mut first = connect(&broker).await;
        let second = connect(&broker).await;
        let channel = first.open_channel().await.unwrap();

        let spec = PublishSpec {
            exchange: String::new(),
            routing_key: "anything".into(),
            mandatory: false,
            immediate: false,
        };
        let result = second.publish(&channel, &spec, b"payload").await;

        assert!(matches!(result, Err(Error::Channel { channel: 1, .. })));
    }

    #[tokio::test]
    async fn return_nothing_after_timeout() {
        let broker = MemoryBroker::default();
        let connection = connect(&broker).await;

        let started = tokio::time::Instant::now();
        let result = connection
            .consume_message(Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn record_returned_mandatory_messages() {
        let broker = MemoryBroker::default();
        let mut connection = connect(&broker).await;
        let channel = connection.open_channel().await.unwrap();

        let exchange = ExchangeSpec::direct("returns");
        assert!(connection
            .transport()
            .exchange_declare(channel.id(), &exchange)
            .await
            .is_normal());

        let spec = PublishSpec {
            exchange: "returns".into(),
            routing_key: "unbound".into(),
            mandatory: true,
            immediate: false,
        };
        connection.publish(&channel, &spec, b"lost").await.unwrap();

        let result = connection
            .consume_message(Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(matches!(
            connection.warnings().snapshot().as_slice(),
            [Warning::MessageReturned { routing_key, .. }] if routing_key == "unbound"
        ));
        assert_eq!(broker.statistics().returned, 1);
    }

    #[tokio::test]
    async fn surface_asynchronous_channel_closes() {
        let broker = MemoryBroker::default();
        let mut connection = connect(&broker).await;
        let channel = connection.open_channel().await.unwrap();

        connection
            .transport()
            .basic_ack(channel.id(), 42, false)
            .await
            .unwrap();

        let result = connection
            .consume_message(Some(Duration::from_millis(50)))
            .await;

        assert_eq!(
            result.unwrap_err().reply_code(),
            Some(reply_code::PRECONDITION_FAILED)
        );
    }

    #[tokio::test]
    async fn deliver_and_acknowledge_messages() {
        let broker = MemoryBroker::default();
        let mut connection = connect(&broker).await;
        let channel = connection.open_channel().await.unwrap();
        let transport = connection.transport();

        assert!(transport
            .exchange_declare(channel.id(), &ExchangeSpec::direct("x"))
            .await
            .is_normal());
        assert!(transport
            .queue_declare(channel.id(), &QueueSpec::shared("q"))
            .await
            .is_normal());
        assert!(transport
            .queue_bind(
                channel.id(),
                &BindingSpec {
                    queue: "q".into(),
                    exchange: "x".into(),
                    routing_key: "q".into(),
                }
            )
            .await
            .is_normal());

        let consume = ConsumeSpec {
            queue: "q".into(),
            consumer_tag: "tag".into(),
            no_local: false,
            no_ack: false,
            exclusive: false,
        };
        connection.consume(&channel, &consume).await.unwrap();

        let publish = PublishSpec {
            exchange: "x".into(),
            routing_key: "q".into(),
            mandatory: true,
            immediate: false,
        };
        connection.publish(&channel, &publish, b"hello").await.unwrap();

        let envelope = connection
            .consume_message(Some(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(envelope.body, b"hello".to_vec());
        assert_eq!(envelope.consumer_tag, "tag");
        assert_eq!(broker.unacked_count("/", "q"), 1);

        connection.ack(envelope).await.unwrap();

        assert_eq!(broker.unacked_count("/", "q"), 0);
        assert_eq!(broker.queue_depth("/", "q"), 0);
    }

    #[tokio::test]
    async fn warn_about_channels_outliving_their_connection() {
        let broker = MemoryBroker::default();
        let mut connection = connect(&broker).await;
        let warnings = connection.warnings().clone();
        let channel = connection.open_channel().await.unwrap();

        connection.close().await.unwrap();
        channel.release().await;

        assert_eq!(
            warnings.snapshot(),
            vec![Warning::StaleResource {
                resource: "channel 1".into()
            }]
        );
    }
}
