//! Sends a single computation request and waits for its response

use async_trait::async_trait;
use std::ops::ControlFlow;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

mod options;

pub use options::Options;

use crate::domain::ComputeRequest;
use crate::harness::{
    DeathReason, Heart, Module, ModuleTerminationReason, PollHandler, PollLoop, StopReason,
};
use crate::library::communication::request::{CorrelationId, Correlator, ResponseOutcome};
use crate::library::communication::{Session, Transport, WarningLog};
use crate::library::{BoxedError, EmptyResult};

/// Failure specific to the client role
#[derive(Debug, Error)]
pub enum ClientError {
    /// The response did not arrive in time
    #[error("no response for request {id} within {deadline:?}")]
    DeadlineExceeded {
        /// Correlation id of the request
        id: CorrelationId,
        /// Deadline that was missed
        deadline: Duration,
    },
    /// A lifecycle hook was called out of order
    #[error("client has not been started")]
    NotStarted,
}

/// Module implementation
///
/// Publishes one request during startup and polls the shared response queue until the
/// matching response arrives, the deadline passes, or the heart dies.
pub struct Client<T> {
    options: Options,
    transport: Option<T>,
    id: Option<CorrelationId>,
    warnings: WarningLog,
    correlator: Option<Correlator<ComputeRequest>>,
    result: Option<i64>,
    requeued: u64,
}

impl<T> Client<T>
where
    T: Transport + 'static,
{
    /// Creates a new instance which connects through the given transport
    pub fn new(options: Options, transport: T) -> Self {
        Self {
            options,
            transport: Some(transport),
            id: None,
            warnings: WarningLog::default(),
            correlator: None,
            result: None,
            requeued: 0,
        }
    }

    /// Uses a fixed correlation id instead of a generated one
    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Correlation id, generated during startup unless one has been set
    pub fn id(&self) -> Option<&CorrelationId> {
        self.id.as_ref()
    }

    /// Value sent to the server
    pub fn value(&self) -> i32 {
        self.options.value
    }

    /// Result of the computation, if it has been received
    pub fn result(&self) -> Option<i64> {
        self.result
    }

    /// Number of foreign responses put back into the queue
    pub fn requeued(&self) -> u64 {
        self.requeued
    }

    /// Warnings recorded by the underlying session
    pub fn warnings(&self) -> &WarningLog {
        &self.warnings
    }
}

struct AwaitResponse<'a> {
    correlator: &'a Correlator<ComputeRequest>,
    deadline: Duration,
    expiry: Instant,
    requeued: &'a mut u64,
    result: &'a mut Option<i64>,
}

#[async_trait]
impl<'a> PollHandler for AwaitResponse<'a> {
    type Item = i64;

    async fn poll(&mut self, timeout: Duration) -> Result<Option<i64>, BoxedError> {
        if Instant::now() >= self.expiry {
            return Err(ClientError::DeadlineExceeded {
                id: self.correlator.id().clone(),
                deadline: self.deadline,
            }
            .into());
        }

        match self.correlator.get_response(timeout).await? {
            ResponseOutcome::Accepted(result) => Ok(Some(result)),
            ResponseOutcome::Requeued(_) => {
                *self.requeued += 1;
                Ok(None)
            }
            ResponseOutcome::Empty => Ok(None),
        }
    }

    async fn dispatch(&mut self, result: i64) -> Result<ControlFlow<()>, BoxedError> {
        *self.result = Some(result);
        Ok(ControlFlow::Break(()))
    }
}

#[async_trait]
impl<T> Module for Client<T>
where
    T: Transport + 'static,
{
    #[instrument(skip_all)]
    async fn pre_startup(&mut self) -> EmptyResult {
        let transport = self
            .transport
            .take()
            .ok_or("client transport has already been used")?;
        let config = self.options.broker.session_config(&self.options.topology);
        let session = Session::open(transport, &config, self.warnings.clone()).await?;
        let format = self.options.topology.wire_format;

        let correlator = match self.id.clone() {
            Some(id) => Correlator::with_id(session, format, id).await?,
            None => Correlator::open(session, format).await?,
        };

        if let Err(error) = correlator.send_request(self.options.value).await {
            if let Err(close_error) = correlator.close().await {
                warn!(%close_error, "Unable to close session after failed request");
            }
            return Err(error.into());
        }

        info!(id = %correlator.id(), "Request sent");
        self.id = Some(correlator.id().clone());
        self.correlator = Some(correlator);

        Ok(())
    }

    async fn run(&mut self, heart: &mut Heart) -> Result<Option<DeathReason>, BoxedError> {
        let correlator = self.correlator.as_ref().ok_or(ClientError::NotStarted)?;
        let mut handler = AwaitResponse {
            correlator,
            deadline: self.options.deadline,
            expiry: Instant::now() + self.options.deadline,
            requeued: &mut self.requeued,
            result: &mut self.result,
        };

        match PollLoop::new(self.options.poll.poll_timeout)
            .run(&mut handler, heart)
            .await?
        {
            StopReason::HeartDied(reason) => Ok(Some(reason)),
            StopReason::Finished => {
                debug!(result = ?self.result, "Response received");
                Ok(None)
            }
        }
    }

    #[instrument(skip_all)]
    async fn post_shutdown(&mut self, _: &ModuleTerminationReason) {
        if let Some(correlator) = self.correlator.take() {
            info!(
                id = %correlator.id(),
                result = ?self.result,
                requeued = self.requeued,
                "Client shutting down"
            );
            if let Err(error) = correlator.close().await {
                error!(%error, "Failed to close session");
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::harness::ModuleRunner;
    use crate::library::communication::implementation::memory::{
        MemoryBroker, RecordingTransport,
    };
    use pretty_assertions::assert_eq;
    use structopt::StructOpt;

    #[tokio::test]
    async fn publish_its_request_during_startup() {
        let broker = MemoryBroker::default();
        let options = Options::from_iter_safe(&["client", "--value", "-5"]).unwrap();
        let mut client =
            Client::new(options, broker.transport()).with_id(CorrelationId::from("A"));

        client.pre_startup().await.unwrap();

        assert_eq!(client.id(), Some(&CorrelationId::from("A")));
        assert_eq!(client.value(), -5);
        assert_eq!(broker.queue_depth("/", "defaultRequestQueue"), 1);
    }

    #[tokio::test]
    async fn fail_after_the_deadline() {
        let broker = MemoryBroker::default();
        let options = Options::from_iter_safe(&[
            "client",
            "--deadline",
            "100",
            "--poll-timeout",
            "20",
        ])
        .unwrap();
        let mut client = Client::new(options, broker.transport());

        let reason = ModuleRunner::default()
            .run(&mut client, Heart::without_heart_stone())
            .await;

        match reason {
            ModuleTerminationReason::OperationalError(error) => {
                assert!(error.downcast_ref::<ClientError>().is_some())
            }
            other => panic!("unexpected termination: {:?}", other),
        }
        assert_eq!(client.result(), None);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn release_its_session_when_the_request_cannot_be_sent() {
        let broker = MemoryBroker::default();
        let options = Options::from_iter_safe(&["client"]).unwrap();
        let transport = RecordingTransport::new(broker.transport()).failing("basic_publish");
        let calls = transport.calls();
        let mut client = Client::new(options, transport);

        let result = client.pre_startup().await;

        assert!(result.is_err());
        assert_eq!(calls.count("basic_cancel"), 1);
        assert_eq!(calls.count("channel_close"), 1);
        assert_eq!(calls.count("connection_close"), 1);
        assert_eq!(broker.connection_count(), 0);
    }
}
