//! Various options usable by modules
//!
//! The structs in this module allow other modules to flatten them into
//! their own options struct. This allows for a unified yet non-cluttered
//! option set.

use crate::library::communication::{SessionConfig, TeardownPolicy, TopologyLayout, WireFormat};
use crate::library::helpers::parse_millis;
use std::time::Duration;
use structopt::StructOpt;

/// Options for connecting to the AMQP broker
#[derive(Debug, Clone, StructOpt)]
pub struct BrokerOptions {
    /// Host name of the broker
    #[structopt(long, env = "AMQP_HOST", default_value = "localhost")]
    pub host: String,

    /// Port of the broker
    #[structopt(long, env = "AMQP_PORT", default_value = "5672")]
    pub port: u16,

    /// User name used to log in
    #[structopt(long, env = "AMQP_LOGIN", default_value = "guest")]
    pub login: String,

    /// Password used to log in
    #[structopt(long, env = "AMQP_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub password: String,

    /// Heartbeat interval in seconds, zero disables heartbeats
    #[structopt(long, env = "AMQP_HEARTBEAT", default_value = "0", value_name = "seconds")]
    pub heartbeat: u16,

    /// Virtual host to open
    #[structopt(long, env = "AMQP_VHOST", default_value = "/")]
    pub vhost: String,
}

/// Options naming the broker-side entities and how they are used
#[derive(Debug, Clone, StructOpt)]
pub struct TopologyOptions {
    /// Direct exchange both queues are bound to
    #[structopt(long, env = "AMQP_EXCHANGE", default_value = "defaultExchange")]
    pub exchange: String,

    /// Queue carrying requests to the server
    #[structopt(long, env = "AMQP_REQUEST_QUEUE", default_value = "defaultRequestQueue")]
    pub request_queue: String,

    /// Queue carrying responses back to the clients
    #[structopt(long, env = "AMQP_RESPONSE_QUEUE", default_value = "defaultResponseQueue")]
    pub response_queue: String,

    /// What happens to exchange, queues and bindings on shutdown
    ///
    /// Values: leave-standing, delete
    #[structopt(long, env = "AMQP_TEARDOWN", default_value = "leave-standing")]
    pub teardown: TeardownPolicy,

    /// Encoding of message bodies
    ///
    /// Values: bson, json
    #[structopt(long, env = "AMQP_WIRE_FORMAT", default_value = "bson")]
    pub wire_format: WireFormat,
}

/// Options for polling the broker
#[derive(Debug, Clone, StructOpt)]
pub struct PollOptions {
    /// Maximum duration (in milliseconds) of a single poll, bounds the shutdown latency
    #[structopt(long, env, default_value = "100", parse(try_from_str = parse_millis), value_name = "millis")]
    pub poll_timeout: Duration,
}

impl BrokerOptions {
    /// Combines the broker options with a topology into a session configuration
    pub fn session_config(&self, topology: &TopologyOptions) -> SessionConfig {
        SessionConfig {
            host: self.host.clone(),
            port: self.port,
            login: self.login.clone(),
            password: self.password.clone(),
            heartbeat: self.heartbeat,
            vhost: self.vhost.clone(),
            layout: topology.layout(),
            teardown: topology.teardown,
        }
    }
}

impl TopologyOptions {
    /// Names of exchange and queues
    pub fn layout(&self) -> TopologyLayout {
        TopologyLayout {
            exchange: self.exchange.clone(),
            request_queue: self.request_queue.clone(),
            response_queue: self.response_queue.clone(),
        }
    }
}
