use crate::library::helpers::parse_millis;
use crate::module::options::{BrokerOptions, PollOptions, TopologyOptions};
use std::time::Duration;
use structopt::StructOpt;

/// Options for the client module
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

    /// Value sent to the server
    #[structopt(long, default_value = "21", allow_hyphen_values = true)]
    pub value: i32,

    /// Maximum duration (in milliseconds) to wait for the response
    #[structopt(long, env, default_value = "10000", parse(try_from_str = parse_millis), value_name = "millis")]
    pub deadline: Duration,
}
