use amqp_rpc::harness::{Heart, ModuleRunner};
use amqp_rpc::library::communication::implementation::amqp::AmqpTransport;
#[cfg(feature = "in-memory")]
use amqp_rpc::module::demo::Demo;
use amqp_rpc::module::{client::Client, server::Server};
use anyhow::Result;
use options::{Command, LogFormat};
use structopt::StructOpt;
use tracing::info;

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let command = init();
    let runner = ModuleRunner::default();

    let (heart, stone) = Heart::new();
    let _signal_listener = stone.terminate_on_signal();

    let reason = match command {
        Command::Server(options) => {
            let mut server = Server::new(options, AmqpTransport::new());
            runner.run(&mut server, heart).await
        }
        Command::Client(options) => {
            let mut client = Client::new(options, AmqpTransport::new());
            let reason = runner.run(&mut client, heart).await;

            if let (Some(id), Some(result)) = (client.id(), client.result()) {
                info!(%id, value = client.value(), result, "Received result");
            }

            reason
        }
        #[cfg(feature = "in-memory")]
        Command::Demo(options) => runner.run(&mut Demo::new(options), heart).await,
    };

    if reason.is_failure() {
        return Err(reason.into());
    }

    info!(%reason, "Exiting");
    Ok(())
}

fn init() -> Command {
    let options = options::MainOptions::from_args();

    let formatter = tracing_subscriber::fmt().with_env_filter(options.log);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("amqp-rpc {}", env!("CARGO_PKG_VERSION"));

    options.command
}
