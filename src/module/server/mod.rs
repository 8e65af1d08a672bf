//! Serves computation requests from the request queue

use async_trait::async_trait;
use std::ops::ControlFlow;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

mod options;

pub use options::Options;

use crate::domain::Doubler;
use crate::harness::{
    DeathReason, Heart, Module, ModuleTerminationReason, PollHandler, PollLoop, StopReason,
};
use crate::library::communication::request::Responder;
use crate::library::communication::{Envelope, Error, Session, Transport, WarningLog};
use crate::library::{BoxedError, EmptyResult};

/// Module implementation
///
/// Answers requests until its heart dies. Requests that can not be decoded are logged and
/// skipped, every other failure stops the module.
pub struct Server<T> {
    options: Options,
    transport: Option<T>,
    warnings: WarningLog,
    responder: Option<Responder<Doubler>>,
    served: u64,
}

impl<T> Server<T>
where
    T: Transport + 'static,
{
    /// Creates a new instance which connects through the given transport
    pub fn new(options: Options, transport: T) -> Self {
        Self {
            options,
            transport: Some(transport),
            warnings: WarningLog::default(),
            responder: None,
            served: 0,
        }
    }

    /// Warnings recorded by the underlying session
    pub fn warnings(&self) -> &WarningLog {
        &self.warnings
    }

    /// Number of requests answered so far
    pub fn served(&self) -> u64 {
        self.served
    }
}

struct ServeRequests<'a> {
    responder: &'a Responder<Doubler>,
    served: &'a mut u64,
}

#[async_trait]
impl<'a> PollHandler for ServeRequests<'a> {
    type Item = Envelope;

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Envelope>, BoxedError> {
        Ok(self.responder.poll(timeout).await?)
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<ControlFlow<()>, BoxedError> {
        match self.responder.respond(envelope).await {
            Ok(()) => {
                *self.served += 1;
                Ok(ControlFlow::Continue(()))
            }
            Err(error @ Error::Deserialization { .. }) => {
                warn!(%error, "Skipping malformed request");
                Ok(ControlFlow::Continue(()))
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl<T> Module for Server<T>
where
    T: Transport + 'static,
{
    #[instrument(skip(self))]
    async fn pre_startup(&mut self) -> EmptyResult {
        let transport = self
            .transport
            .take()
            .ok_or("server transport has already been used")?;
        let config = self.options.broker.session_config(&self.options.topology);
        let session = Session::open(transport, &config, self.warnings.clone()).await?;
        let responder =
            Responder::open(session, Doubler, self.options.topology.wire_format).await?;

        info!(queue = %config.layout.request_queue, "Serving requests");
        self.responder = Some(responder);

        Ok(())
    }

    async fn run(&mut self, heart: &mut Heart) -> Result<Option<DeathReason>, BoxedError> {
        let responder = self
            .responder
            .as_ref()
            .ok_or("server has not been started")?;
        let mut handler = ServeRequests {
            responder,
            served: &mut self.served,
        };

        match PollLoop::new(self.options.poll.poll_timeout)
            .run(&mut handler, heart)
            .await?
        {
            StopReason::HeartDied(reason) => Ok(Some(reason)),
            StopReason::Finished => Ok(None),
        }
    }

    #[instrument(skip_all)]
    async fn post_shutdown(&mut self, _: &ModuleTerminationReason) {
        info!(served = self.served, "Server shutting down");

        if let Some(responder) = self.responder.take() {
            if let Err(error) = responder.close().await {
                error!(%error, "Failed to close session");
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::ComputeRequest;
    use crate::harness::ModuleRunner;
    use crate::library::communication::Codec;
    use crate::library::communication::implementation::memory::MemoryBroker;
    use crate::library::communication::WireFormat;
    use pretty_assertions::assert_eq;
    use structopt::StructOpt;

    fn options() -> Options {
        Options::from_iter_safe(&["server", "--poll-timeout", "20"]).unwrap()
    }

    #[tokio::test]
    async fn answer_requests_until_killed() {
        let broker = MemoryBroker::default();
        let mut server = Server::new(options(), broker.transport());
        let (heart, mut stone) = Heart::new();
        let request = WireFormat::Bson
            .encode(&ComputeRequest {
                id: "A".into(),
                value: 21,
            })
            .unwrap();

        let handle = tokio::spawn(async move {
            let reason = ModuleRunner::default().run(&mut server, heart).await;
            (reason, server)
        });
        while broker.consumer_count("/", "defaultRequestQueue") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(broker.publish_raw("/", "defaultExchange", "defaultRequestQueue", request));
        while broker.queue_depth("/", "defaultResponseQueue") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stone.kill("test finished".to_owned()).await;

        let (reason, server) = handle.await.unwrap();

        assert!(matches!(reason, ModuleTerminationReason::HeartDied(_)));
        assert_eq!(server.served(), 1);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn skip_malformed_requests() {
        let broker = MemoryBroker::default();
        let mut server = Server::new(options(), broker.transport());
        let (heart, mut stone) = Heart::new();

        let handle = tokio::spawn(async move {
            let reason = ModuleRunner::default().run(&mut server, heart).await;
            (reason, server)
        });
        while broker.consumer_count("/", "defaultRequestQueue") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(broker.publish_raw("/", "defaultExchange", "defaultRequestQueue", b"?".to_vec()));
        while broker.unacked_count("/", "defaultRequestQueue") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stone.kill("test finished".to_owned()).await;

        let (reason, server) = handle.await.unwrap();

        assert!(!reason.is_failure());
        assert_eq!(server.served(), 0);
        assert_eq!(broker.statistics().published, 1);
    }

    #[tokio::test]
    async fn fail_to_start_with_wrong_credentials() {
        let broker = MemoryBroker::default();
        let options =
            Options::from_iter_safe(&["server", "--password", "wrong"]).unwrap();
        let mut server = Server::new(options, broker.transport());

        let reason = ModuleRunner::default()
            .run(&mut server, Heart::without_heart_stone())
            .await;

        assert!(matches!(reason, ModuleTerminationReason::StartupFailed(_)));
    }
}
