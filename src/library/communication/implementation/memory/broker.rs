use super::transport::MemoryTransport;
use crate::library::communication::protocol::{
    reply_code, ChannelId, DeliveryTag, Frame, LibraryError, Method, ReplyStatus, RpcReply,
};
use crate::library::communication::transport::{
    BindingSpec, ConsumeSpec, Envelope, ExchangeKind, ExchangeSpec, LoginSpec, PublishSpec,
    QueueSpec,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

pub(super) type ConnectionId = u64;

/// How a queue picks the consumer for its next message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOrder {
    /// Consumers take turns in the order they subscribed
    RoundRobin,
    /// A consumer is picked at random, reproducible through the seed
    Shuffled {
        /// Seed of the random number generator
        seed: u64,
    },
}

/// Settings of a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Host name the broker is reachable under
    pub host: String,
    /// Port the broker is reachable under
    pub port: u16,
    /// Accepted user names and their passwords
    pub users: HashMap<String, String>,
    /// Existing virtual hosts
    pub vhosts: HashSet<String>,
    /// Highest channel id the broker accepts
    pub channel_max: u16,
    /// Consumer selection of all queues
    pub dispatch: DispatchOrder,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let mut users = HashMap::new();
        users.insert("guest".to_owned(), "guest".to_owned());

        let mut vhosts = HashSet::new();
        vhosts.insert("/".to_owned());

        Self {
            host: "localhost".to_owned(),
            port: 5672,
            users,
            vhosts,
            channel_max: 2047,
            dispatch: DispatchOrder::RoundRobin,
        }
    }
}

/// Message counters of a [`MemoryBroker`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStatistics {
    /// Messages accepted from publishers, routed or not
    pub published: u64,
    /// Deliveries handed to consumers, redeliveries included
    pub delivered: u64,
    /// Deliveries acknowledged by consumers
    pub acknowledged: u64,
    /// Deliveries rejected by consumers
    pub rejected: u64,
    /// Deliveries put back into their queue
    pub requeued: u64,
    /// Mandatory messages returned as unroutable
    pub returned: u64,
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
    /// Consumers that rejected this message since it was last offered to all of them
    declined: Vec<(ConnectionId, ChannelId)>,
}

struct Consumer {
    connection: ConnectionId,
    channel: ChannelId,
    tag: String,
    no_ack: bool,
}

impl Consumer {
    fn key(&self) -> (ConnectionId, ChannelId) {
        (self.connection, self.channel)
    }
}

struct QueueState {
    spec: QueueSpec,
    owner: Option<ConnectionId>,
    messages: VecDeque<Message>,
    consumers: Vec<Consumer>,
    exclusive_consumer: bool,
    cursor: usize,
}

struct BindingState {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    spec: ExchangeSpec,
    bindings: Vec<BindingState>,
}

#[derive(Default)]
struct VhostState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

struct PendingAck {
    queue: String,
    message: Message,
}

#[derive(Default)]
struct ChannelState {
    last_tag: DeliveryTag,
    prefetch: u16,
    unacked: BTreeMap<DeliveryTag, PendingAck>,
}

impl ChannelState {
    /// Whether the prefetch window admits another delivery, zero means unlimited
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

/// Item waiting to be read by a connection
pub(super) enum Inbound {
    Delivery(Envelope),
    Returned {
        channel: ChannelId,
        status: ReplyStatus,
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
    },
    Frame(Frame),
}

pub(super) struct ConnectionState {
    vhost: Option<String>,
    channel_max: u16,
    channels: HashMap<ChannelId, ChannelState>,
    pub(super) inbox: VecDeque<Inbound>,
    pub(super) notify: Arc<Notify>,
    pub(super) pending_content: Option<(ChannelId, Vec<u8>)>,
}

impl ConnectionState {
    fn push(&mut self, inbound: Inbound) {
        self.inbox.push_back(inbound);
        self.notify.notify_one();
    }
}

pub(super) struct BrokerState {
    config: BrokerConfig,
    vhosts: HashMap<String, VhostState>,
    pub(super) connections: HashMap<ConnectionId, ConnectionState>,
    next_connection: ConnectionId,
    rng: Option<StdRng>,
    statistics: BrokerStatistics,
}

fn channel_close(code: u16, text: impl Into<String>) -> RpcReply {
    RpcReply::ServerException(Method::ChannelClose(ReplyStatus::new(code, text)))
}

fn connection_close(code: u16, text: impl Into<String>) -> RpcReply {
    RpcReply::ServerException(Method::ConnectionClose(ReplyStatus::new(code, text)))
}

impl BrokerState {
    fn new(config: BrokerConfig) -> Self {
        let vhosts = config
            .vhosts
            .iter()
            .map(|name| (name.clone(), VhostState::default()))
            .collect();
        let rng = match config.dispatch {
            DispatchOrder::RoundRobin => None,
            DispatchOrder::Shuffled { seed } => Some(StdRng::seed_from_u64(seed)),
        };

        Self {
            config,
            vhosts,
            connections: HashMap::new(),
            next_connection: 1,
            rng,
            statistics: BrokerStatistics::default(),
        }
    }

    /// Virtual host of a logged in connection with the given channel open
    fn open_channel_vhost(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
    ) -> Result<String, RpcReply> {
        let state = self
            .connections
            .get(&connection)
            .ok_or(RpcReply::LibraryException(LibraryError::ConnectionClosed))?;
        let vhost = state.vhost.clone().ok_or_else(|| {
            connection_close(reply_code::NOT_ALLOWED, "NOT_ALLOWED - not logged in")
        })?;

        if state.channels.contains_key(&channel) {
            Ok(vhost)
        } else {
            Err(channel_close(
                reply_code::CHANNEL_ERROR,
                format!("CHANNEL_ERROR - channel {} is not open", channel),
            ))
        }
    }

    /// Closes a channel from the broker side as the answer to a synchronous call
    fn fail_channel(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        code: u16,
        text: String,
    ) -> RpcReply {
        debug!(connection, channel, code, %text, "Closing channel");
        self.release_channel(connection, channel);
        channel_close(code, text)
    }

    /// Closes a channel from the broker side while the client is not waiting for a reply
    fn fail_channel_async(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        code: u16,
        text: String,
    ) {
        debug!(connection, channel, code, %text, "Closing channel asynchronously");
        self.release_channel(connection, channel);

        if let Some(state) = self.connections.get_mut(&connection) {
            state.push(Inbound::Frame(Frame::method(
                channel,
                Method::ChannelClose(ReplyStatus::new(code, text)),
            )));
        }
    }

    /// Async variant of [`Self::open_channel_vhost`] for calls that only report a status
    fn status_vhost(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
    ) -> Result<Option<String>, LibraryError> {
        match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => Ok(Some(vhost)),
            Err(RpcReply::ServerException(Method::ChannelClose(status))) => {
                self.fail_channel_async(connection, channel, status.code, status.text);
                Ok(None)
            }
            Err(_) => Err(LibraryError::ConnectionClosed),
        }
    }

    fn release_channel(&mut self, connection: ConnectionId, channel: ChannelId) {
        let (vhost, state) = match self.connections.get_mut(&connection) {
            Some(c) => (c.vhost.clone(), c.channels.remove(&channel)),
            None => return,
        };

        if let Some(vhost) = vhost {
            self.drop_consumers(&vhost, |c| c.connection == connection && c.channel == channel);

            if let Some(state) = state {
                self.requeue(&vhost, state.unacked.into_iter().rev().map(|(_, p)| p));
            }
        }
    }

    pub(super) fn release_connection(&mut self, connection: ConnectionId) {
        let (vhost, channels) = match self.connections.get(&connection) {
            Some(c) => (c.vhost.clone(), c.channels.keys().copied().collect::<Vec<_>>()),
            None => return,
        };

        for channel in channels {
            self.release_channel(connection, channel);
        }

        if let Some(vhost) = vhost {
            let owned: Vec<String> = self
                .vhosts
                .get(&vhost)
                .map(|v| {
                    v.queues
                        .iter()
                        .filter(|(_, q)| q.owner == Some(connection))
                        .map(|(name, _)| name.clone())
                        .collect()
                })
                .unwrap_or_default();

            for queue in owned {
                self.remove_queue(&vhost, &queue);
            }
        }

        self.connections.remove(&connection);
        debug!(connection, "Connection released");
    }

    fn drop_consumers(&mut self, vhost: &str, predicate: impl Fn(&Consumer) -> bool) {
        let mut abandoned = Vec::new();
        let mut remaining = Vec::new();

        if let Some(v) = self.vhosts.get_mut(vhost) {
            for (name, queue) in v.queues.iter_mut() {
                let before = queue.consumers.len();
                queue.consumers.retain(|c| !predicate(c));

                if queue.consumers.len() == before {
                    continue;
                }

                if queue.consumers.is_empty() {
                    queue.exclusive_consumer = false;
                    if queue.spec.auto_delete {
                        abandoned.push(name.clone());
                    }
                } else {
                    remaining.push(name.clone());
                }
            }
        }

        for queue in abandoned {
            debug!(%queue, "Auto-deleting queue without consumers");
            self.remove_queue(vhost, &queue);
        }

        self.dispatch_all(vhost, remaining);
    }

    /// Queues a channel consumes from
    fn consumed_queues(
        &self,
        vhost: &str,
        connection: ConnectionId,
        channel: ChannelId,
    ) -> Vec<String> {
        self.vhosts
            .get(vhost)
            .map(|v| {
                v.queues
                    .iter()
                    .filter(|(_, q)| q.consumers.iter().any(|c| c.key() == (connection, channel)))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove_queue(&mut self, vhost: &str, queue: &str) {
        if let Some(v) = self.vhosts.get_mut(vhost) {
            v.queues.remove(queue);

            let mut unused = Vec::new();
            for (name, exchange) in v.exchanges.iter_mut() {
                let before = exchange.bindings.len();
                exchange.bindings.retain(|b| b.queue != queue);

                if before != exchange.bindings.len()
                    && exchange.bindings.is_empty()
                    && exchange.spec.auto_delete
                {
                    unused.push(name.clone());
                }
            }

            for name in unused {
                debug!(exchange = %name, "Auto-deleting exchange without bindings");
                v.exchanges.remove(&name);
            }
        }
    }

    fn requeue(&mut self, vhost: &str, pending: impl Iterator<Item = PendingAck>) {
        let mut touched = Vec::new();

        for PendingAck { queue, mut message } in pending {
            let state = self
                .vhosts
                .get_mut(vhost)
                .and_then(|v| v.queues.get_mut(&queue));

            if let Some(state) = state {
                message.redelivered = true;
                state.messages.push_front(message);
                self.statistics.requeued += 1;

                touched.push(queue);
            }
        }

        self.dispatch_all(vhost, touched);
    }

    fn dispatch_all(&mut self, vhost: &str, queues: Vec<String>) {
        let mut queues = queues;
        queues.sort_unstable();
        queues.dedup();

        for queue in queues {
            self.dispatch(vhost, &queue);
        }
    }

    /// Hands queued messages to consumers with room in their prefetch window
    ///
    /// A requeued message skips the consumers that already rejected it until every current
    /// consumer has done so. This keeps rejected messages moving between competing consumers.
    fn dispatch(&mut self, vhost: &str, queue_name: &str) {
        let BrokerState {
            vhosts,
            connections,
            rng,
            statistics,
            ..
        } = self;

        let queue = match vhosts.get_mut(vhost).and_then(|v| v.queues.get_mut(queue_name)) {
            Some(queue) => queue,
            None => return,
        };

        loop {
            let head = match queue.messages.front_mut() {
                Some(message) => message,
                None => break,
            };

            if queue.consumers.iter().all(|c| head.declined.contains(&c.key())) {
                head.declined.clear();
            }

            let eligible: Vec<usize> = queue
                .consumers
                .iter()
                .enumerate()
                .filter(|(_, consumer)| !head.declined.contains(&consumer.key()))
                .filter(|(_, consumer)| {
                    connections
                        .get(&consumer.connection)
                        .and_then(|c| c.channels.get(&consumer.channel))
                        .map_or(false, ChannelState::has_capacity)
                })
                .map(|(index, _)| index)
                .collect();

            if eligible.is_empty() {
                break;
            }

            let index = match rng {
                Some(rng) => eligible[rng.gen_range(0..eligible.len())],
                None => {
                    let count = queue.consumers.len();
                    let index = (0..count)
                        .map(|offset| (queue.cursor + offset) % count)
                        .find(|index| eligible.contains(index))
                        .unwrap_or(eligible[0]);
                    queue.cursor = index + 1;
                    index
                }
            };

            let message = match queue.messages.pop_front() {
                Some(message) => message,
                None => break,
            };

            let consumer = &queue.consumers[index];
            let connection = match connections.get_mut(&consumer.connection) {
                Some(connection) => connection,
                None => {
                    queue.messages.push_front(message);
                    break;
                }
            };

            let delivery_tag = match connection.channels.get_mut(&consumer.channel) {
                Some(channel) => {
                    channel.last_tag += 1;
                    if !consumer.no_ack {
                        channel.unacked.insert(
                            channel.last_tag,
                            PendingAck {
                                queue: queue_name.to_owned(),
                                message: message.clone(),
                            },
                        );
                    }
                    channel.last_tag
                }
                None => {
                    queue.messages.push_front(message);
                    break;
                }
            };

            trace!(
                queue = queue_name,
                connection = consumer.connection,
                delivery_tag,
                "Dispatching message"
            );
            connection.push(Inbound::Delivery(Envelope {
                channel: consumer.channel,
                delivery_tag,
                consumer_tag: consumer.tag.clone(),
                exchange: message.exchange,
                routing_key: message.routing_key,
                redelivered: message.redelivered,
                body: message.body,
            }));
            statistics.delivered += 1;
        }
    }

    /// Queues a message in every matching queue and returns whether it was routed anywhere
    fn route(
        &mut self,
        vhost: &str,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Option<bool> {
        let v = self.vhosts.get(vhost)?;

        let targets: Vec<String> = if exchange.is_empty() {
            v.queues
                .keys()
                .filter(|name| name.as_str() == routing_key)
                .cloned()
                .collect()
        } else {
            let state = v.exchanges.get(exchange)?;
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| state.spec.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect();
            targets.sort_unstable();
            targets.dedup();
            targets
        };

        for queue in &targets {
            if let Some(state) = self
                .vhosts
                .get_mut(vhost)
                .and_then(|v| v.queues.get_mut(queue))
            {
                state.messages.push_back(Message {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    body: body.to_vec(),
                    redelivered: false,
                    declined: Vec::new(),
                });
            }
            self.dispatch(vhost, queue);
        }

        Some(!targets.is_empty())
    }

    fn open_socket(
        &mut self,
        connection: ConnectionId,
        host: &str,
        port: u16,
    ) -> Result<(), LibraryError> {
        if host != self.config.host {
            return Err(LibraryError::HostnameResolutionFailed);
        }
        if port != self.config.port {
            return Err(LibraryError::SocketError);
        }

        self.connections
            .entry(connection)
            .or_insert_with(|| ConnectionState {
                vhost: None,
                channel_max: 0,
                channels: HashMap::new(),
                inbox: VecDeque::new(),
                notify: Arc::new(Notify::new()),
                pending_content: None,
            });

        Ok(())
    }

    fn login(&mut self, connection: ConnectionId, spec: &LoginSpec) -> RpcReply {
        if !self.connections.contains_key(&connection) {
            return RpcReply::LibraryException(LibraryError::ConnectionClosed);
        }

        if self.config.users.get(&spec.login) != Some(&spec.password) {
            self.release_connection(connection);
            return connection_close(
                reply_code::ACCESS_REFUSED,
                "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN",
            );
        }

        if !self.vhosts.contains_key(&spec.vhost) {
            self.release_connection(connection);
            return connection_close(
                reply_code::NOT_ALLOWED,
                format!("NOT_ALLOWED - vhost {} not found", spec.vhost),
            );
        }

        let channel_max = match (self.config.channel_max, spec.channel_max) {
            (0, requested) => requested,
            (limit, 0) => limit,
            (limit, requested) => limit.min(requested),
        };

        if let Some(state) = self.connections.get_mut(&connection) {
            state.vhost = Some(spec.vhost.clone());
            state.channel_max = channel_max;
        }

        RpcReply::Normal
    }

    fn channel_open(&mut self, connection: ConnectionId, channel: ChannelId) -> RpcReply {
        let state = match self.connections.get_mut(&connection) {
            Some(state) => state,
            None => return RpcReply::LibraryException(LibraryError::ConnectionClosed),
        };

        if state.vhost.is_none() {
            return connection_close(reply_code::NOT_ALLOWED, "NOT_ALLOWED - not logged in");
        }

        if channel == 0 || (state.channel_max != 0 && channel > state.channel_max) {
            self.release_connection(connection);
            return connection_close(
                reply_code::NOT_ALLOWED,
                format!("NOT_ALLOWED - channel id {} out of range", channel),
            );
        }

        if state.channels.contains_key(&channel) {
            return channel_close(
                reply_code::CHANNEL_ERROR,
                format!("CHANNEL_ERROR - channel {} is already open", channel),
            );
        }

        state.channels.insert(channel, ChannelState::default());
        RpcReply::Normal
    }

    fn channel_close(&mut self, connection: ConnectionId, channel: ChannelId) -> RpcReply {
        if !self.connections.contains_key(&connection) {
            return RpcReply::LibraryException(LibraryError::ConnectionClosed);
        }

        self.release_channel(connection, channel);
        RpcReply::Normal
    }

    fn exchange_declare(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &ExchangeSpec,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        if spec.name.is_empty() || spec.name.starts_with("amq.") {
            return self.fail_channel(
                connection,
                channel,
                reply_code::ACCESS_REFUSED,
                format!("ACCESS_REFUSED - exchange name '{}' is reserved", spec.name),
            );
        }

        let existing = self
            .vhosts
            .get(&vhost)
            .and_then(|v| v.exchanges.get(&spec.name))
            .map(|e| e.spec.clone());

        match existing {
            Some(existing) => {
                let mismatch = if existing.kind != spec.kind {
                    Some("type")
                } else if existing.durable != spec.durable {
                    Some("durable")
                } else if existing.auto_delete != spec.auto_delete {
                    Some("auto_delete")
                } else if existing.internal != spec.internal {
                    Some("internal")
                } else {
                    None
                };

                match mismatch {
                    Some(field) if !spec.passive => self.fail_channel(
                        connection,
                        channel,
                        reply_code::PRECONDITION_FAILED,
                        format!(
                            "PRECONDITION_FAILED - inequivalent arg '{}' \
                             for exchange '{}' in vhost '{}'",
                            field, spec.name, vhost
                        ),
                    ),
                    _ => RpcReply::Normal,
                }
            }
            None if spec.passive => self.fail_channel(
                connection,
                channel,
                reply_code::NOT_FOUND,
                format!("NOT_FOUND - no exchange '{}' in vhost '{}'", spec.name, vhost),
            ),
            None => {
                if let Some(v) = self.vhosts.get_mut(&vhost) {
                    v.exchanges.insert(
                        spec.name.clone(),
                        ExchangeState {
                            spec: spec.clone(),
                            bindings: Vec::new(),
                        },
                    );
                }
                RpcReply::Normal
            }
        }
    }

    fn exchange_delete(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        name: &str,
        if_unused: bool,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        let in_use = match self.vhosts.get(&vhost).and_then(|v| v.exchanges.get(name)) {
            Some(exchange) => !exchange.bindings.is_empty(),
            None => return RpcReply::Normal,
        };

        if if_unused && in_use {
            return self.fail_channel(
                connection,
                channel,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - exchange '{}' in vhost '{}' in use", name, vhost),
            );
        }

        if let Some(v) = self.vhosts.get_mut(&vhost) {
            v.exchanges.remove(name);
        }
        RpcReply::Normal
    }

    fn queue_declare(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &QueueSpec,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        let existing = self
            .vhosts
            .get(&vhost)
            .and_then(|v| v.queues.get(&spec.name))
            .map(|q| (q.spec.clone(), q.owner));

        match existing {
            Some((_, Some(owner))) if owner != connection => self.fail_channel(
                connection,
                channel,
                reply_code::RESOURCE_LOCKED,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access \
                     to locked queue '{}' in vhost '{}'",
                    spec.name, vhost
                ),
            ),
            Some((existing, _)) => {
                let mismatch = if existing.durable != spec.durable {
                    Some("durable")
                } else if existing.exclusive != spec.exclusive {
                    Some("exclusive")
                } else if existing.auto_delete != spec.auto_delete {
                    Some("auto_delete")
                } else {
                    None
                };

                match mismatch {
                    Some(field) if !spec.passive => self.fail_channel(
                        connection,
                        channel,
                        reply_code::PRECONDITION_FAILED,
                        format!(
                            "PRECONDITION_FAILED - inequivalent arg '{}' \
                             for queue '{}' in vhost '{}'",
                            field, spec.name, vhost
                        ),
                    ),
                    _ => RpcReply::Normal,
                }
            }
            None if spec.passive => self.fail_channel(
                connection,
                channel,
                reply_code::NOT_FOUND,
                format!("NOT_FOUND - no queue '{}' in vhost '{}'", spec.name, vhost),
            ),
            None => {
                if let Some(v) = self.vhosts.get_mut(&vhost) {
                    v.queues.insert(
                        spec.name.clone(),
                        QueueState {
                            spec: spec.clone(),
                            owner: if spec.exclusive { Some(connection) } else { None },
                            messages: VecDeque::new(),
                            consumers: Vec::new(),
                            exclusive_consumer: false,
                            cursor: 0,
                        },
                    );
                }
                RpcReply::Normal
            }
        }
    }

    fn queue_delete(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        let (consumed, filled) = match self.vhosts.get(&vhost).and_then(|v| v.queues.get(name)) {
            Some(queue) => (!queue.consumers.is_empty(), !queue.messages.is_empty()),
            None => return RpcReply::Normal,
        };

        if if_unused && consumed {
            return self.fail_channel(
                connection,
                channel,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - queue '{}' in vhost '{}' in use", name, vhost),
            );
        }

        if if_empty && filled {
            return self.fail_channel(
                connection,
                channel,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - queue '{}' in vhost '{}' not empty", name, vhost),
            );
        }

        self.remove_queue(&vhost, name);
        RpcReply::Normal
    }

    fn queue_bind(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &BindingSpec,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        let (exchange_exists, queue_exists) = match self.vhosts.get(&vhost) {
            Some(v) => (
                v.exchanges.contains_key(&spec.exchange),
                v.queues.contains_key(&spec.queue),
            ),
            None => (false, false),
        };

        if !exchange_exists || !queue_exists {
            let missing = if exchange_exists {
                format!("queue '{}'", spec.queue)
            } else {
                format!("exchange '{}'", spec.exchange)
            };
            return self.fail_channel(
                connection,
                channel,
                reply_code::NOT_FOUND,
                format!("NOT_FOUND - no {} in vhost '{}'", missing, vhost),
            );
        }

        if let Some(exchange) = self
            .vhosts
            .get_mut(&vhost)
            .and_then(|v| v.exchanges.get_mut(&spec.exchange))
        {
            let bound = exchange
                .bindings
                .iter()
                .any(|b| b.queue == spec.queue && b.routing_key == spec.routing_key);

            if !bound {
                exchange.bindings.push(BindingState {
                    queue: spec.queue.clone(),
                    routing_key: spec.routing_key.clone(),
                });
            }
        }

        RpcReply::Normal
    }

    fn queue_unbind(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &BindingSpec,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        if let Some(v) = self.vhosts.get_mut(&vhost) {
            let unused = match v.exchanges.get_mut(&spec.exchange) {
                Some(exchange) => {
                    let before = exchange.bindings.len();
                    exchange
                        .bindings
                        .retain(|b| !(b.queue == spec.queue && b.routing_key == spec.routing_key));

                    before != exchange.bindings.len()
                        && exchange.bindings.is_empty()
                        && exchange.spec.auto_delete
                }
                None => false,
            };

            if unused {
                debug!(exchange = %spec.exchange, "Auto-deleting exchange without bindings");
                v.exchanges.remove(&spec.exchange);
            }
        }

        RpcReply::Normal
    }

    fn basic_consume(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &ConsumeSpec,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        let (owner, consumers, exclusive_consumer, duplicate) =
            match self.vhosts.get(&vhost).and_then(|v| v.queues.get(&spec.queue)) {
                Some(queue) => (
                    queue.owner,
                    queue.consumers.len(),
                    queue.exclusive_consumer,
                    queue
                        .consumers
                        .iter()
                        .any(|c| c.key() == (connection, channel) && c.tag == spec.consumer_tag),
                ),
                None => {
                    return self.fail_channel(
                        connection,
                        channel,
                        reply_code::NOT_FOUND,
                        format!("NOT_FOUND - no queue '{}' in vhost '{}'", spec.queue, vhost),
                    )
                }
            };

        if matches!(owner, Some(owner) if owner != connection) {
            return self.fail_channel(
                connection,
                channel,
                reply_code::RESOURCE_LOCKED,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access \
                     to locked queue '{}' in vhost '{}'",
                    spec.queue, vhost
                ),
            );
        }

        if exclusive_consumer || (spec.exclusive && consumers > 0) {
            return self.fail_channel(
                connection,
                channel,
                reply_code::ACCESS_REFUSED,
                format!(
                    "ACCESS_REFUSED - queue '{}' in vhost '{}' in exclusive use",
                    spec.queue, vhost
                ),
            );
        }

        if duplicate {
            return self.fail_channel(
                connection,
                channel,
                reply_code::NOT_ALLOWED,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", spec.consumer_tag),
            );
        }

        let tag = if spec.consumer_tag.is_empty() {
            format!("amq.ctag-{}-{}", connection, channel)
        } else {
            spec.consumer_tag.clone()
        };

        if let Some(queue) = self
            .vhosts
            .get_mut(&vhost)
            .and_then(|v| v.queues.get_mut(&spec.queue))
        {
            queue.exclusive_consumer = spec.exclusive;
            queue.consumers.push(Consumer {
                connection,
                channel,
                tag,
                no_ack: spec.no_ack,
            });
        }

        self.dispatch(&vhost, &spec.queue);
        RpcReply::Normal
    }

    fn basic_cancel(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        tag: &str,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        self.drop_consumers(&vhost, |c| {
            c.connection == connection && c.channel == channel && c.tag == tag
        });
        RpcReply::Normal
    }

    fn basic_publish(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &PublishSpec,
        body: &[u8],
    ) -> Result<(), LibraryError> {
        let vhost = match self.status_vhost(connection, channel)? {
            Some(vhost) => vhost,
            None => return Ok(()),
        };

        self.statistics.published += 1;

        match self.route(&vhost, &spec.exchange, &spec.routing_key, body) {
            None => {
                self.fail_channel_async(
                    connection,
                    channel,
                    reply_code::NOT_FOUND,
                    format!("NOT_FOUND - no exchange '{}' in vhost '{}'", spec.exchange, vhost),
                );
            }
            Some(false) if spec.mandatory => {
                self.statistics.returned += 1;
                if let Some(state) = self.connections.get_mut(&connection) {
                    state.push(Inbound::Returned {
                        channel,
                        status: ReplyStatus::new(reply_code::NO_ROUTE, "NO_ROUTE"),
                        exchange: spec.exchange.clone(),
                        routing_key: spec.routing_key.clone(),
                        body: body.to_vec(),
                    });
                }
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn settle(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<Option<(String, Vec<PendingAck>)>, LibraryError> {
        let vhost = match self.status_vhost(connection, channel)? {
            Some(vhost) => vhost,
            None => return Ok(None),
        };

        let unacked = match self
            .connections
            .get_mut(&connection)
            .and_then(|c| c.channels.get_mut(&channel))
        {
            Some(state) => &mut state.unacked,
            None => return Ok(None),
        };

        if !unacked.contains_key(&delivery_tag) {
            self.fail_channel_async(
                connection,
                channel,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
            );
            return Ok(None);
        }

        let tags: Vec<DeliveryTag> = if multiple {
            unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else {
            vec![delivery_tag]
        };
        let settled = tags.into_iter().filter_map(|tag| unacked.remove(&tag)).collect();

        Ok(Some((vhost, settled)))
    }

    fn basic_ack(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), LibraryError> {
        if let Some((vhost, settled)) = self.settle(connection, channel, delivery_tag, multiple)? {
            self.statistics.acknowledged += settled.len() as u64;

            let freed = self.consumed_queues(&vhost, connection, channel);
            self.dispatch_all(&vhost, freed);
        }
        Ok(())
    }

    fn basic_reject(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), LibraryError> {
        if let Some((vhost, settled)) = self.settle(connection, channel, delivery_tag, false)? {
            self.statistics.rejected += settled.len() as u64;

            if requeue {
                let declined = settled.into_iter().map(|mut pending| {
                    pending.message.declined.push((connection, channel));
                    pending
                });
                self.requeue(&vhost, declined);
            }

            let freed = self.consumed_queues(&vhost, connection, channel);
            self.dispatch_all(&vhost, freed);
        }
        Ok(())
    }

    fn basic_qos(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        prefetch_count: u16,
    ) -> RpcReply {
        let vhost = match self.open_channel_vhost(connection, channel) {
            Ok(vhost) => vhost,
            Err(reply) => return reply,
        };

        if let Some(state) = self
            .connections
            .get_mut(&connection)
            .and_then(|c| c.channels.get_mut(&channel))
        {
            state.prefetch = prefetch_count;
        }

        let queues = self.consumed_queues(&vhost, connection, channel);
        self.dispatch_all(&vhost, queues);
        RpcReply::Normal
    }
}

/// In-process AMQP broker
///
/// Every [`MemoryTransport`] obtained from [`MemoryBroker::transport`] acts as one independent
/// client connection. The broker keeps exchanges, queues, bindings, consumers and unacknowledged
/// deliveries per virtual host and follows the semantics of a RabbitMQ broker where this crate
/// relies on them: idempotent declarations, competing consumers, requeue on reject and on
/// connection loss, auto-deletion, and returned mandatory messages. Like RabbitMQ it ignores
/// `no_local` and `immediate`. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl MemoryBroker {
    /// Creates an empty broker
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(config))),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a new, not yet connected client connection
    pub fn transport(&self) -> MemoryTransport {
        let id = {
            let mut state = self.lock();
            let id = state.next_connection;
            state.next_connection += 1;
            id
        };

        MemoryTransport::new(self.clone(), id)
    }

    /// Number of connections with an open socket
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Message counters collected so far
    pub fn statistics(&self) -> BrokerStatistics {
        self.lock().statistics.clone()
    }

    /// Number of messages waiting in a queue, zero for missing queues
    pub fn queue_depth(&self, vhost: &str, queue: &str) -> usize {
        self.lock()
            .vhosts
            .get(vhost)
            .and_then(|v| v.queues.get(queue))
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Number of deliveries from a queue that await acknowledgement
    pub fn unacked_count(&self, vhost: &str, queue: &str) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.vhost.as_deref() == Some(vhost))
            .flat_map(|c| c.channels.values())
            .flat_map(|c| c.unacked.values())
            .filter(|p| p.queue == queue)
            .count()
    }

    /// Number of consumers subscribed to a queue
    pub fn consumer_count(&self, vhost: &str, queue: &str) -> usize {
        self.lock()
            .vhosts
            .get(vhost)
            .and_then(|v| v.queues.get(queue))
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Whether the exchange exists
    pub fn exchange_exists(&self, vhost: &str, exchange: &str) -> bool {
        self.lock()
            .vhosts
            .get(vhost)
            .map(|v| v.exchanges.contains_key(exchange))
            .unwrap_or(false)
    }

    /// Whether the queue exists
    pub fn queue_exists(&self, vhost: &str, queue: &str) -> bool {
        self.lock()
            .vhosts
            .get(vhost)
            .map(|v| v.queues.contains_key(queue))
            .unwrap_or(false)
    }

    /// Whether the queue is bound to the exchange with the routing key
    pub fn binding_exists(
        &self,
        vhost: &str,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> bool {
        self.lock()
            .vhosts
            .get(vhost)
            .and_then(|v| v.exchanges.get(exchange))
            .map(|e| {
                e.bindings
                    .iter()
                    .any(|b| b.queue == queue && b.routing_key == routing_key)
            })
            .unwrap_or(false)
    }

    /// Publishes a message without a client connection, returns whether it was routed
    pub fn publish_raw(
        &self,
        vhost: &str,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> bool {
        let mut state = self.lock();
        state.statistics.published += 1;
        state
            .route(vhost, exchange, routing_key, &body)
            .unwrap_or(false)
    }

    /// Appends a raw frame to the stream of a connection, returns whether the connection exists
    pub fn inject_frame(&self, connection: u64, frame: Frame) -> bool {
        match self.lock().connections.get_mut(&connection) {
            Some(state) => {
                state.push(Inbound::Frame(frame));
                true
            }
            None => false,
        }
    }

    pub(super) fn open_socket(
        &self,
        connection: ConnectionId,
        host: &str,
        port: u16,
    ) -> Result<(), LibraryError> {
        self.lock().open_socket(connection, host, port)
    }

    pub(super) fn login(&self, connection: ConnectionId, spec: &LoginSpec) -> RpcReply {
        self.lock().login(connection, spec)
    }

    pub(super) fn channel_open(&self, connection: ConnectionId, channel: ChannelId) -> RpcReply {
        self.lock().channel_open(connection, channel)
    }

    pub(super) fn channel_close(&self, connection: ConnectionId, channel: ChannelId) -> RpcReply {
        self.lock().channel_close(connection, channel)
    }

    pub(super) fn exchange_declare(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &ExchangeSpec,
    ) -> RpcReply {
        self.lock().exchange_declare(connection, channel, spec)
    }

    pub(super) fn exchange_delete(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        name: &str,
        if_unused: bool,
    ) -> RpcReply {
        self.lock().exchange_delete(connection, channel, name, if_unused)
    }

    pub(super) fn queue_declare(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &QueueSpec,
    ) -> RpcReply {
        self.lock().queue_declare(connection, channel, spec)
    }

    pub(super) fn queue_delete(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> RpcReply {
        self.lock()
            .queue_delete(connection, channel, name, if_unused, if_empty)
    }

    pub(super) fn queue_bind(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &BindingSpec,
    ) -> RpcReply {
        self.lock().queue_bind(connection, channel, spec)
    }

    pub(super) fn queue_unbind(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &BindingSpec,
    ) -> RpcReply {
        self.lock().queue_unbind(connection, channel, spec)
    }

    pub(super) fn basic_qos(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        prefetch_count: u16,
    ) -> RpcReply {
        self.lock().basic_qos(connection, channel, prefetch_count)
    }

    pub(super) fn basic_consume(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &ConsumeSpec,
    ) -> RpcReply {
        self.lock().basic_consume(connection, channel, spec)
    }

    pub(super) fn basic_cancel(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        tag: &str,
    ) -> RpcReply {
        self.lock().basic_cancel(connection, channel, tag)
    }

    pub(super) fn basic_publish(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        spec: &PublishSpec,
        body: &[u8],
    ) -> Result<(), LibraryError> {
        self.lock().basic_publish(connection, channel, spec, body)
    }

    pub(super) fn basic_ack(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), LibraryError> {
        self.lock()
            .basic_ack(connection, channel, delivery_tag, multiple)
    }

    pub(super) fn basic_reject(
        &self,
        connection: ConnectionId,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), LibraryError> {
        self.lock()
            .basic_reject(connection, channel, delivery_tag, requeue)
    }

    pub(super) fn connection_close(&self, connection: ConnectionId) -> RpcReply {
        let mut state = self.lock();

        if !state.connections.contains_key(&connection) {
            return RpcReply::LibraryException(LibraryError::ConnectionClosed);
        }

        state.release_connection(connection);
        RpcReply::Normal
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn login_spec() -> LoginSpec {
        LoginSpec {
            vhost: "/".into(),
            login: "guest".into(),
            password: "guest".into(),
            heartbeat: 0,
            channel_max: 2047,
            frame_max: 131_072,
        }
    }

    fn connect(broker: &MemoryBroker, connection: ConnectionId) {
        broker.open_socket(connection, "localhost", 5672).unwrap();
        assert!(broker.login(connection, &login_spec()).is_normal());
        assert!(broker.channel_open(connection, 1).is_normal());
    }

    fn setup(broker: &MemoryBroker, connection: ConnectionId) {
        assert!(broker
            .exchange_declare(connection, 1, &ExchangeSpec::direct("x"))
            .is_normal());
        assert!(broker
            .queue_declare(connection, 1, &QueueSpec::shared("q"))
            .is_normal());
        assert!(broker
            .queue_bind(
                connection,
                1,
                &BindingSpec {
                    queue: "q".into(),
                    exchange: "x".into(),
                    routing_key: "q".into()
                }
            )
            .is_normal());
    }

    fn consume(broker: &MemoryBroker, connection: ConnectionId, tag: &str) -> RpcReply {
        broker.basic_consume(
            connection,
            1,
            &ConsumeSpec {
                queue: "q".into(),
                consumer_tag: tag.into(),
                no_local: true,
                no_ack: false,
                exclusive: false,
            },
        )
    }

    fn deliveries(broker: &MemoryBroker, connection: ConnectionId) -> Vec<(DeliveryTag, Vec<u8>)> {
        broker
            .lock()
            .connections
            .get(&connection)
            .map(|c| {
                c.inbox
                    .iter()
                    .filter_map(|i| match i {
                        Inbound::Delivery(e) => Some((e.delivery_tag, e.body.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn alternate_between_competing_consumers() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);
        connect(&broker, 2);
        setup(&broker, 1);
        assert!(consume(&broker, 1, "a").is_normal());
        assert!(consume(&broker, 2, "b").is_normal());

        for body in [b"1", b"2", b"3"] {
            assert!(broker.publish_raw("/", "x", "q", body.to_vec()));
        }

        assert_eq!(deliveries(&broker, 1), vec![(1, b"1".to_vec()), (2, b"3".to_vec())]);
        assert_eq!(deliveries(&broker, 2), vec![(1, b"2".to_vec())]);
    }

    #[test]
    fn requeue_rejected_messages_as_redelivered() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);
        setup(&broker, 1);
        assert!(consume(&broker, 1, "a").is_normal());
        broker.publish_raw("/", "x", "q", b"m".to_vec());

        broker.lock().connections.get_mut(&1).unwrap().inbox.clear();
        broker.basic_reject(1, 1, 1, true).unwrap();

        let redelivered = broker.lock().connections.get_mut(&1).unwrap().inbox.pop_front();
        assert!(matches!(
            redelivered,
            Some(Inbound::Delivery(Envelope { delivery_tag: 2, redelivered: true, .. }))
        ));
        assert_eq!(broker.statistics().requeued, 1);
    }

    #[test]
    fn close_channel_on_unknown_delivery_tag() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);

        broker.basic_ack(1, 1, 7, false).unwrap();

        let state = broker.lock();
        let connection = state.connections.get(&1).unwrap();
        assert!(matches!(
            connection.inbox.front(),
            Some(Inbound::Frame(Frame { channel: 1, .. }))
        ));
        assert!(!connection.channels.contains_key(&1));
    }

    #[test]
    fn refuse_reserved_exchange_names() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);

        let reply = broker.exchange_declare(1, 1, &ExchangeSpec::direct("amq.direct"));

        assert_eq!(
            reply,
            channel_close(
                reply_code::ACCESS_REFUSED,
                "ACCESS_REFUSED - exchange name 'amq.direct' is reserved"
            )
        );
    }

    #[test]
    fn auto_delete_queues_after_last_consumer() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);
        setup(&broker, 1);
        assert!(consume(&broker, 1, "a").is_normal());

        assert!(broker.basic_cancel(1, 1, "a").is_normal());

        assert!(!broker.queue_exists("/", "q"));
        assert!(!broker.exchange_exists("/", "x"));
    }

    #[test]
    fn guard_deletion_of_used_entities() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);
        setup(&broker, 1);

        let reply = broker.exchange_delete(1, 1, "x", true);

        assert!(matches!(
            reply,
            RpcReply::ServerException(Method::ChannelClose(ReplyStatus {
                code: reply_code::PRECONDITION_FAILED,
                ..
            }))
        ));
        assert!(broker.exchange_exists("/", "x"));
    }

    #[test]
    fn drop_exclusive_queues_with_their_owner() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);
        connect(&broker, 2);
        let mut spec = QueueSpec::shared("private");
        spec.exclusive = true;
        assert!(broker.queue_declare(1, 1, &spec).is_normal());

        let reply = broker.queue_declare(2, 1, &spec);
        assert!(matches!(
            reply,
            RpcReply::ServerException(Method::ChannelClose(ReplyStatus {
                code: reply_code::RESOURCE_LOCKED,
                ..
            }))
        ));

        assert!(broker.connection_close(1).is_normal());
        assert!(!broker.queue_exists("/", "private"));
    }

    #[test]
    fn shuffle_reproducibly() {
        let picks = |seed| {
            let broker = MemoryBroker::new(BrokerConfig {
                dispatch: DispatchOrder::Shuffled { seed },
                ..Default::default()
            });
            connect(&broker, 1);
            connect(&broker, 2);
            setup(&broker, 1);
            assert!(consume(&broker, 1, "a").is_normal());
            assert!(consume(&broker, 2, "b").is_normal());
            for _ in 0..8 {
                broker.publish_raw("/", "x", "q", b"m".to_vec());
            }
            deliveries(&broker, 1).len()
        };

        assert_eq!(picks(7), picks(7));
    }

    #[test]
    fn withhold_deliveries_beyond_the_prefetch_window() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);
        setup(&broker, 1);
        assert!(broker.basic_qos(1, 1, 1).is_normal());
        assert!(consume(&broker, 1, "a").is_normal());

        broker.publish_raw("/", "x", "q", b"1".to_vec());
        broker.publish_raw("/", "x", "q", b"2".to_vec());

        assert_eq!(deliveries(&broker, 1), vec![(1, b"1".to_vec())]);
        assert_eq!(broker.queue_depth("/", "q"), 1);

        broker.basic_ack(1, 1, 1, false).unwrap();

        assert_eq!(
            deliveries(&broker, 1),
            vec![(1, b"1".to_vec()), (2, b"2".to_vec())]
        );
        assert_eq!(broker.queue_depth("/", "q"), 0);
    }

    #[test]
    fn offer_rejected_messages_to_other_consumers() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);
        connect(&broker, 2);
        setup(&broker, 1);
        for connection in [1, 2] {
            assert!(broker.basic_qos(connection, 1, 1).is_normal());
        }
        assert!(consume(&broker, 1, "a").is_normal());
        assert!(consume(&broker, 2, "b").is_normal());

        broker.publish_raw("/", "x", "q", b"for-b".to_vec());
        broker.publish_raw("/", "x", "q", b"for-a".to_vec());
        assert_eq!(deliveries(&broker, 1), vec![(1, b"for-b".to_vec())]);
        assert_eq!(deliveries(&broker, 2), vec![(1, b"for-a".to_vec())]);

        broker.basic_reject(1, 1, 1, true).unwrap();
        assert_eq!(broker.queue_depth("/", "q"), 1);

        broker.basic_reject(2, 1, 1, true).unwrap();

        assert_eq!(
            deliveries(&broker, 1),
            vec![(1, b"for-b".to_vec()), (2, b"for-a".to_vec())]
        );
        assert_eq!(
            deliveries(&broker, 2),
            vec![(1, b"for-a".to_vec()), (2, b"for-b".to_vec())]
        );
        assert_eq!(broker.queue_depth("/", "q"), 0);
    }

    #[test]
    fn hand_messages_of_departed_consumers_to_the_rest() {
        let broker = MemoryBroker::default();
        connect(&broker, 1);
        connect(&broker, 2);
        setup(&broker, 1);
        for connection in [1, 2] {
            assert!(broker.basic_qos(connection, 1, 1).is_normal());
        }
        assert!(consume(&broker, 1, "a").is_normal());
        assert!(consume(&broker, 2, "b").is_normal());
        for body in [b"1", b"2", b"3"] {
            broker.publish_raw("/", "x", "q", body.to_vec());
        }

        assert!(broker.basic_cancel(1, 1, "a").is_normal());
        assert!(broker.channel_close(1, 1).is_normal());
        broker.basic_ack(2, 1, 1, false).unwrap();

        assert_eq!(
            deliveries(&broker, 2),
            vec![(1, b"2".to_vec()), (2, b"1".to_vec())]
        );
        assert_eq!(broker.queue_depth("/", "q"), 1);
    }
}
