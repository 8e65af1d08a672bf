use super::connection::{Channel, Connection};
use super::error::Error;
use super::topology::{TeardownPolicy, Topology, TopologyLayout};
use super::transport::{
    ConsumeSpec, Envelope, LoginSpec, PublishSpec, Transport, DEFAULT_CHANNEL_MAX,
    DEFAULT_FRAME_MAX,
};
use super::warning::WarningLog;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Unacknowledged deliveries a competing consumer may hold at once
pub const COMPETING_PREFETCH: u16 = 1;

/// Everything needed to reach the broker and declare the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// User name
    pub login: String,
    /// Password
    pub password: String,
    /// Heartbeat interval in seconds, zero disables heartbeats
    pub heartbeat: u16,
    /// Virtual host
    pub vhost: String,
    /// Names of exchange and queues
    pub layout: TopologyLayout,
    /// Fate of the topology when the session closes
    pub teardown: TeardownPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            login: "guest".to_owned(),
            password: "guest".to_owned(),
            heartbeat: 0,
            vhost: "/".to_owned(),
            layout: TopologyLayout::default(),
            teardown: TeardownPolicy::default(),
        }
    }
}

/// Queue of the request/response topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Queue carrying requests to the server
    Request,
    /// Queue carrying responses back to the clients
    Response,
}

/// Connection, channel and topology of one participant
///
/// Resources are acquired in the order socket, login, channel, topology and released
/// in reverse by [`Session::close`]. A failure while opening releases everything that
/// was acquired up to that point.
pub struct Session {
    connection: Connection,
    channel: Channel,
    topology: Topology,
    consumer: Option<String>,
}

impl Session {
    /// Connects using the given transport and declares the topology
    #[instrument(
        skip(transport, config, warnings),
        fields(host = %config.host, port = config.port, vhost = %config.vhost)
    )]
    pub async fn open<T: Transport + 'static>(
        transport: T,
        config: &SessionConfig,
        warnings: WarningLog,
    ) -> Result<Self, Error> {
        let mut connection = Connection::new(transport, warnings);

        connection.open_socket(&config.host, config.port).await?;

        let login = connection
            .login(&LoginSpec {
                vhost: config.vhost.clone(),
                login: config.login.clone(),
                password: config.password.clone(),
                heartbeat: config.heartbeat,
                channel_max: DEFAULT_CHANNEL_MAX,
                frame_max: DEFAULT_FRAME_MAX,
            })
            .await;

        match login {
            Ok(()) => {}
            // The broker closes the connection along with a refusal
            Err(error @ Error::Auth { .. }) => return Err(error),
            Err(error) => {
                abandon(connection, "failed login").await;
                return Err(error);
            }
        }

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(error) => {
                abandon(connection, "failed channel open").await;
                return Err(error);
            }
        };

        let topology =
            match Topology::bind(&connection, &channel, config.layout.clone(), config.teardown)
                .await
            {
                Ok(topology) => topology,
                Err(error) => {
                    channel.release().await;
                    abandon(connection, "failed declaration").await;
                    return Err(error);
                }
            };

        info!("Session established");
        Ok(Self {
            connection,
            channel,
            topology,
            consumer: None,
        })
    }

    /// Names of the exchange and queues
    pub fn layout(&self) -> &TopologyLayout {
        self.topology.layout()
    }

    /// Log receiving the warnings of this session
    pub fn warnings(&self) -> &WarningLog {
        self.connection.warnings()
    }

    fn queue(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Request => self.topology.request_routing_key(),
            Endpoint::Response => self.topology.response_routing_key(),
        }
    }

    /// Starts consuming from one of the queues
    ///
    /// Deliveries require explicit acknowledgement. An exclusive consumer refuses
    /// every other consumer on the queue. A shared consumer holds at most
    /// [`COMPETING_PREFETCH`] unacknowledged deliveries, so whatever it rejects
    /// can be handed to the other consumers.
    pub async fn consume(&mut self, endpoint: Endpoint, exclusive: bool) -> Result<(), Error> {
        if !exclusive {
            self.connection
                .qos(&self.channel, COMPETING_PREFETCH)
                .await?;
        }

        let spec = ConsumeSpec {
            queue: self.queue(endpoint).to_owned(),
            consumer_tag: format!("amq.ctag-{}", Uuid::new_v4().to_simple()),
            no_local: true,
            no_ack: false,
            exclusive,
        };

        self.connection.consume(&self.channel, &spec).await?;
        self.consumer = Some(spec.consumer_tag);

        Ok(())
    }

    /// Publishes a mandatory message to the exchange, routed to one of the queues
    pub async fn publish(&self, endpoint: Endpoint, body: &[u8]) -> Result<(), Error> {
        let spec = PublishSpec {
            exchange: self.topology.layout().exchange.clone(),
            routing_key: self.queue(endpoint).to_owned(),
            mandatory: true,
            immediate: false,
        };

        self.connection.publish(&self.channel, &spec, body).await
    }

    /// Performs one bounded poll for the next delivery, see [`Connection::consume_message`]
    pub async fn poll(&self, timeout: Option<Duration>) -> Result<Option<Envelope>, Error> {
        self.connection.consume_message(timeout).await
    }

    /// Acknowledges a delivery
    pub async fn ack(&self, envelope: Envelope) -> Result<(), Error> {
        self.connection.ack(envelope).await
    }

    /// Rejects a delivery
    pub async fn reject(&self, envelope: Envelope, requeue: bool) -> Result<(), Error> {
        self.connection.reject(envelope, requeue).await
    }

    /// Cancels the consumer and releases topology, channel and connection in that order
    #[instrument(skip(self))]
    pub async fn close(self) -> Result<(), Error> {
        if let Some(tag) = &self.consumer {
            if let Err(error) = self.connection.cancel(&self.channel, tag).await {
                self.channel
                    .backref()
                    .teardown_failed(&format!("consumer {}", tag), &error);
            }
        }

        self.topology.release().await;
        self.channel.release().await;
        self.connection.close().await?;

        info!("Session closed");
        Ok(())
    }
}

async fn abandon(connection: Connection, after: &str) {
    if let Err(error) = connection.close().await {
        warn!(%error, "Unable to close connection after {}", after);
    }
}
