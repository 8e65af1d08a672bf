use std::str::FromStr;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(about = "Correlated request/response exchange over a shared AMQP broker.")]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        default_value = "info",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Format of log lines
    ///
    /// Values: text, compact, json
    #[structopt(long, global = true, default_value = "text", env, value_name = "format")]
    pub log_format: LogFormat,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Answers computation requests until terminated
    Server(amqp_rpc::module::server::Options),
    /// Sends one computation request and waits for its result
    Client(amqp_rpc::module::client::Options),
    /// Runs a server and several clients against an in-memory broker
    #[cfg(feature = "in-memory")]
    Demo(amqp_rpc::module::demo::Options),
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}
