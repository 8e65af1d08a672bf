//! Broker-side entities shared by all participants
//!
//! Exchanges, queues and bindings are declared idempotently: declaring an entity that
//! already exists with identical parameters succeeds, while inequivalent parameters are
//! rejected by the broker and surface as [`Error::Topology`]. Whether the entities are
//! removed again when a participant shuts down is governed by the [`TeardownPolicy`].

use super::connection::{BackRef, Channel, Connection};
use super::error::Error;
use super::protocol::ChannelId;
use super::transport::{BindingSpec, ExchangeSpec, QueueSpec};
use super::validation::validate;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// What happens to broker-side entities when they are released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownPolicy {
    /// Keep everything on the broker so other participants can continue to use it
    LeaveStanding,
    /// Unbind and delete, guarded so entities still in use stay untouched
    Delete,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        TeardownPolicy::LeaveStanding
    }
}

impl FromStr for TeardownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leave-standing" => Ok(TeardownPolicy::LeaveStanding),
            "delete" => Ok(TeardownPolicy::Delete),
            other => Err(format!(
                "unknown teardown policy '{}', expected leave-standing or delete",
                other
            )),
        }
    }
}

impl Display for TeardownPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TeardownPolicy::LeaveStanding => write!(f, "leave-standing"),
            TeardownPolicy::Delete => write!(f, "delete"),
        }
    }
}

/// Shared state of every declared entity
struct Declared {
    channel: ChannelId,
    backref: BackRef,
    policy: TeardownPolicy,
}

/// Declared exchange
pub struct Exchange {
    spec: ExchangeSpec,
    declared: Declared,
}

impl Exchange {
    /// Declares the exchange on the given channel
    pub async fn declare(
        connection: &Connection,
        channel: &Channel,
        spec: ExchangeSpec,
        policy: TeardownPolicy,
    ) -> Result<Self, Error> {
        let reply = connection
            .transport()
            .exchange_declare(channel.id(), &spec)
            .await;
        validate(&reply, "exchange.declare")
            .map_err(|e| Error::topology(format!("failed to declare exchange {}", spec.name), e))?;

        info!(exchange = %spec.name, kind = spec.kind.as_str(), "Declared exchange");
        Ok(Self {
            spec,
            declared: declared(channel, policy),
        })
    }

    /// Name of the exchange
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Deletes the exchange if the policy asks for it and nothing is bound to it anymore
    pub async fn release(self) {
        let resource = format!("exchange {}", self.spec.name);
        let Declared {
            channel,
            backref,
            policy,
        } = self.declared;

        if let Some(link) = backref.upgrade(&resource) {
            if policy == TeardownPolicy::LeaveStanding {
                debug!(%resource, "Leaving exchange standing");
                return;
            }

            let reply = link
                .transport()
                .exchange_delete(channel, &self.spec.name, true)
                .await;
            match validate(&reply, "exchange.delete") {
                Ok(()) => info!(%resource, "Deleted exchange"),
                Err(error) => backref.teardown_failed(&resource, &error),
            }
        }
    }
}

/// Declared queue
pub struct Queue {
    spec: QueueSpec,
    declared: Declared,
}

impl Queue {
    /// Declares the queue on the given channel
    pub async fn declare(
        connection: &Connection,
        channel: &Channel,
        spec: QueueSpec,
        policy: TeardownPolicy,
    ) -> Result<Self, Error> {
        let reply = connection
            .transport()
            .queue_declare(channel.id(), &spec)
            .await;
        validate(&reply, "queue.declare")
            .map_err(|e| Error::topology(format!("failed to declare queue {}", spec.name), e))?;

        info!(queue = %spec.name, "Declared queue");
        Ok(Self {
            spec,
            declared: declared(channel, policy),
        })
    }

    /// Name of the queue
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Deletes the queue if the policy asks for it and it is neither consumed nor holds messages
    pub async fn release(self) {
        let resource = format!("queue {}", self.spec.name);
        let Declared {
            channel,
            backref,
            policy,
        } = self.declared;

        if let Some(link) = backref.upgrade(&resource) {
            if policy == TeardownPolicy::LeaveStanding {
                debug!(%resource, "Leaving queue standing");
                return;
            }

            let reply = link
                .transport()
                .queue_delete(channel, &self.spec.name, true, true)
                .await;
            match validate(&reply, "queue.delete") {
                Ok(()) => info!(%resource, "Deleted queue"),
                Err(error) => backref.teardown_failed(&resource, &error),
            }
        }
    }
}

/// Declared binding between a queue and an exchange
pub struct Binding {
    spec: BindingSpec,
    declared: Declared,
}

impl Binding {
    /// Binds the queue to the exchange using the queue name as routing key
    pub async fn declare(
        connection: &Connection,
        channel: &Channel,
        queue: &Queue,
        exchange: &Exchange,
        policy: TeardownPolicy,
    ) -> Result<Self, Error> {
        let spec = BindingSpec {
            queue: queue.name().to_owned(),
            exchange: exchange.name().to_owned(),
            routing_key: queue.name().to_owned(),
        };

        let reply = connection.transport().queue_bind(channel.id(), &spec).await;
        validate(&reply, "queue.bind").map_err(|e| {
            Error::topology(
                format!("failed to bind queue {} to exchange {}", spec.queue, spec.exchange),
                e,
            )
        })?;

        info!(
            queue = %spec.queue,
            exchange = %spec.exchange,
            routing_key = %spec.routing_key,
            "Bound queue"
        );
        Ok(Self {
            spec,
            declared: declared(channel, policy),
        })
    }

    /// Routing key of the binding
    pub fn routing_key(&self) -> &str {
        &self.spec.routing_key
    }

    /// Removes the binding if the policy asks for it
    pub async fn release(self) {
        let resource = format!(
            "binding {} -> {} ({})",
            self.spec.exchange, self.spec.queue, self.spec.routing_key
        );
        let Declared {
            channel,
            backref,
            policy,
        } = self.declared;

        if let Some(link) = backref.upgrade(&resource) {
            if policy == TeardownPolicy::LeaveStanding {
                debug!(%resource, "Leaving binding standing");
                return;
            }

            let reply = link.transport().queue_unbind(channel, &self.spec).await;
            match validate(&reply, "queue.unbind") {
                Ok(()) => info!(%resource, "Removed binding"),
                Err(error) => backref.teardown_failed(&resource, &error),
            }
        }
    }
}

fn declared(channel: &Channel, policy: TeardownPolicy) -> Declared {
    Declared {
        channel: channel.id(),
        backref: channel.backref().clone(),
        policy,
    }
}

/// Names of the entities that make up the request/response topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyLayout {
    /// Direct exchange both queues are bound to
    pub exchange: String,
    /// Queue the server consumes requests from
    pub request_queue: String,
    /// Queue clients consume responses from
    pub response_queue: String,
}

impl Default for TopologyLayout {
    fn default() -> Self {
        Self {
            exchange: "defaultExchange".to_owned(),
            request_queue: "defaultRequestQueue".to_owned(),
            response_queue: "defaultResponseQueue".to_owned(),
        }
    }
}

/// Exchange, request and response queue, and the bindings between them
pub struct Topology {
    layout: TopologyLayout,
    exchange: Exchange,
    request_queue: Queue,
    response_queue: Queue,
    request_binding: Binding,
    response_binding: Binding,
}

#[derive(Default)]
struct PartialTopology {
    exchange: Option<Exchange>,
    request_queue: Option<Queue>,
    response_queue: Option<Queue>,
    request_binding: Option<Binding>,
    response_binding: Option<Binding>,
}

impl PartialTopology {
    async fn release(self) {
        if let Some(binding) = self.request_binding {
            binding.release().await;
        }
        if let Some(binding) = self.response_binding {
            binding.release().await;
        }
        if let Some(queue) = self.request_queue {
            queue.release().await;
        }
        if let Some(queue) = self.response_queue {
            queue.release().await;
        }
        if let Some(exchange) = self.exchange {
            exchange.release().await;
        }
    }
}

impl Topology {
    /// Declares all entities of the layout
    ///
    /// Entities are declared in the order exchange, response queue, request queue, response
    /// binding, request binding. If one of them fails, those declared so far are released in
    /// reverse order before the error is returned.
    #[instrument(skip(connection, channel), fields(channel = channel.id()))]
    pub async fn bind(
        connection: &Connection,
        channel: &Channel,
        layout: TopologyLayout,
        policy: TeardownPolicy,
    ) -> Result<Self, Error> {
        let mut partial = PartialTopology::default();

        if let Err(error) =
            Self::declare_all(connection, channel, &layout, policy, &mut partial).await
        {
            partial.release().await;
            return Err(error);
        }

        match partial {
            PartialTopology {
                exchange: Some(exchange),
                request_queue: Some(request_queue),
                response_queue: Some(response_queue),
                request_binding: Some(request_binding),
                response_binding: Some(response_binding),
            } => Ok(Self {
                layout,
                exchange,
                request_queue,
                response_queue,
                request_binding,
                response_binding,
            }),
            partial => {
                partial.release().await;
                Err(Error::Protocol {
                    context: "topology".to_owned(),
                    message: "declaration finished incomplete".to_owned(),
                })
            }
        }
    }

    async fn declare_all(
        connection: &Connection,
        channel: &Channel,
        layout: &TopologyLayout,
        policy: TeardownPolicy,
        partial: &mut PartialTopology,
    ) -> Result<(), Error> {
        partial.exchange = Some(
            Exchange::declare(
                connection,
                channel,
                ExchangeSpec::direct(&layout.exchange),
                policy,
            )
            .await?,
        );
        partial.response_queue = Some(
            Queue::declare(
                connection,
                channel,
                QueueSpec::shared(&layout.response_queue),
                policy,
            )
            .await?,
        );
        partial.request_queue = Some(
            Queue::declare(
                connection,
                channel,
                QueueSpec::shared(&layout.request_queue),
                policy,
            )
            .await?,
        );

        if let (Some(exchange), Some(response_queue), Some(request_queue)) = (
            partial.exchange.as_ref(),
            partial.response_queue.as_ref(),
            partial.request_queue.as_ref(),
        ) {
            let response_binding =
                Binding::declare(connection, channel, response_queue, exchange, policy).await;
            partial.response_binding = Some(response_binding?);

            let request_binding =
                Binding::declare(connection, channel, request_queue, exchange, policy).await;
            partial.request_binding = Some(request_binding?);
        }

        debug!(exchange = %layout.exchange, "Topology complete");
        Ok(())
    }

    /// Names of the declared entities
    pub fn layout(&self) -> &TopologyLayout {
        &self.layout
    }

    /// Routing key that reaches the request queue
    pub fn request_routing_key(&self) -> &str {
        self.request_binding.routing_key()
    }

    /// Routing key that reaches the response queue
    pub fn response_routing_key(&self) -> &str {
        self.response_binding.routing_key()
    }

    /// Releases all entities in reverse order of their declaration
    pub async fn release(self) {
        PartialTopology {
            exchange: Some(self.exchange),
            request_queue: Some(self.request_queue),
            response_queue: Some(self.response_queue),
            request_binding: Some(self.request_binding),
            response_binding: Some(self.response_binding),
        }
        .release()
        .await
    }
}
