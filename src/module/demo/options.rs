use crate::library::helpers::parse_millis;
use crate::module::options::{BrokerOptions, PollOptions, TopologyOptions};
use std::time::Duration;
use structopt::StructOpt;

/// Options for the demo module
#[derive(Debug, Clone, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub topology: TopologyOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub poll: PollOptions,

    /// Number of clients competing for responses
    #[structopt(long, default_value = "3")]
    pub clients: usize,

    /// Value sent by the first client, every further client adds one
    #[structopt(long, default_value = "21", allow_hyphen_values = true)]
    pub value: i32,

    /// Maximum duration (in milliseconds) each client waits for its response
    #[structopt(long, default_value = "10000", parse(try_from_str = parse_millis), value_name = "millis")]
    pub deadline: Duration,

    /// Hand messages to randomly picked consumers instead of taking turns
    #[structopt(long, value_name = "seed")]
    pub shuffle: Option<u64>,
}
