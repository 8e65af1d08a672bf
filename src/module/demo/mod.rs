//! Runs a server and several clients against a broker living inside the process

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

mod options;

pub use options::Options;

use crate::domain::transform;
use crate::harness::{DeathReason, Heart, Module, ModuleRunner};
use crate::library::communication::implementation::memory::{
    BrokerConfig, DispatchOrder, MemoryBroker,
};
use crate::library::communication::request::CorrelationId;
use crate::library::{BoxedError, EmptyResult};
use crate::module::{client, server};

/// Failure of the demo as a whole
#[derive(Debug, Error)]
pub enum DemoError {
    /// At least one client did not obtain its own result
    #[error("{failed} of {total} clients did not receive their result")]
    ClientsFailed {
        /// Number of unsuccessful clients
        failed: usize,
        /// Number of clients that took part
        total: usize,
    },
    /// The server task could not be joined
    #[error("server task failed")]
    ServerPanicked(#[source] tokio::task::JoinError),
    /// A lifecycle hook was called out of order
    #[error("demo has not been started")]
    NotStarted,
}

/// Outcome of a single client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReport {
    /// Correlation id used by the client
    pub id: Option<CorrelationId>,
    /// Value that was sent
    pub value: i32,
    /// Result the server is expected to compute
    pub expected: i64,
    /// Result that was received
    pub result: Option<i64>,
    /// Number of foreign responses the client put back
    pub requeued: u64,
    /// Termination reason if the client failed
    pub failure: Option<String>,
}

impl ClientReport {
    /// Whether the client received exactly its own result
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.result == Some(self.expected)
    }
}

impl Display for ClientReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let id = self
            .id
            .as_ref()
            .map(CorrelationId::as_str)
            .unwrap_or("<none>");

        match (&self.result, &self.failure) {
            (Some(result), _) => write!(f, "client {}: {} -> {}", id, self.value, result),
            (None, Some(failure)) => {
                write!(f, "client {}: {} -> failed ({})", id, self.value, failure)
            }
            (None, None) => write!(f, "client {}: {} -> no result", id, self.value),
        }
    }
}

/// Module implementation
pub struct Demo {
    options: Options,
    broker: Option<MemoryBroker>,
    reports: Vec<ClientReport>,
    served: u64,
}

impl Demo {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            broker: None,
            reports: Vec::new(),
            served: 0,
        }
    }

    /// Outcome of every client, available after the run
    pub fn reports(&self) -> &[ClientReport] {
        &self.reports
    }

    /// Number of requests answered by the server
    pub fn served(&self) -> u64 {
        self.served
    }

    fn broker_config(&self) -> BrokerConfig {
        let broker = &self.options.broker;

        let mut users = HashMap::new();
        users.insert(broker.login.clone(), broker.password.clone());

        let mut vhosts = HashSet::new();
        vhosts.insert(broker.vhost.clone());

        BrokerConfig {
            host: broker.host.clone(),
            port: broker.port,
            users,
            vhosts,
            dispatch: match self.options.shuffle {
                Some(seed) => DispatchOrder::Shuffled { seed },
                None => DispatchOrder::RoundRobin,
            },
            ..Default::default()
        }
    }

    fn server_options(&self) -> server::Options {
        server::Options {
            broker: self.options.broker.clone(),
            topology: self.options.topology.clone(),
            poll: self.options.poll.clone(),
        }
    }

    fn client_options(&self, index: usize) -> client::Options {
        let offset = i32::try_from(index).unwrap_or(i32::MAX);

        client::Options {
            broker: self.options.broker.clone(),
            topology: self.options.topology.clone(),
            poll: self.options.poll.clone(),
            value: self.options.value.saturating_add(offset),
            deadline: self.options.deadline,
        }
    }
}

#[async_trait]
impl Module for Demo {
    #[instrument(skip_all)]
    async fn pre_startup(&mut self) -> EmptyResult {
        let config = self.broker_config();
        info!(
            host = %config.host,
            port = config.port,
            dispatch = ?config.dispatch,
            "Starting in-memory broker"
        );
        self.broker = Some(MemoryBroker::new(config));
        Ok(())
    }

    async fn run(&mut self, heart: &mut Heart) -> Result<Option<DeathReason>, BoxedError> {
        let broker = self.broker.clone().ok_or(DemoError::NotStarted)?;

        let (server_heart, mut server_stone) = Heart::new();
        let mut server = server::Server::new(self.server_options(), broker.transport());
        let server_task = tokio::spawn(async move {
            let reason = ModuleRunner::default().run(&mut server, server_heart).await;
            (reason, server.served())
        });

        let clients: Vec<_> = (0..self.options.clients)
            .map(|index| client::Client::new(self.client_options(index), broker.transport()))
            .collect();

        let runs = clients.into_iter().map(|mut client| {
            async move {
                let reason = ModuleRunner::default()
                    .run(&mut client, Heart::without_heart_stone())
                    .await;

                ClientReport {
                    id: client.id().cloned(),
                    value: client.value(),
                    expected: transform(client.value()),
                    result: client.result(),
                    requeued: client.requeued(),
                    failure: if reason.is_failure() {
                        Some(report_chain(&reason))
                    } else {
                        None
                    },
                }
            }
        });

        let reports = tokio::select! {
            reports = join_all(runs) => reports,
            reason = heart.death() => {
                warn!(%reason, "Demo interrupted");
                server_stone.kill(reason.to_string()).await;
                server_task.await.map_err(DemoError::ServerPanicked)?;
                return Ok(Some(reason));
            }
        };

        server_stone.kill("all clients finished".to_owned()).await;
        let (server_reason, served) = server_task.await.map_err(DemoError::ServerPanicked)?;
        if server_reason.is_failure() {
            error!(reason = %report_chain(&server_reason), "Server terminated abnormally");
        }
        self.served = served;

        for report in &reports {
            if report.is_success() {
                info!(requeued = report.requeued, "{}", report);
            } else {
                error!(requeued = report.requeued, "{}", report);
            }
        }

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        let total = reports.len();
        self.reports = reports;

        if failed > 0 {
            Err(DemoError::ClientsFailed { failed, total }.into())
        } else {
            Ok(None)
        }
    }
}

/// Formats an error together with its sources
fn report_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}
