use crate::module::options::{BrokerOptions, PollOptions, TopologyOptions};
use structopt::StructOpt;

/// Options for the server module
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
}
