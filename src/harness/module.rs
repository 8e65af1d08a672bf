use super::{DeathReason, Heart};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::any::type_name;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

/// Executable module
#[async_trait]
pub trait Module {
    /// Executed before running the core loop
    async fn pre_startup(&mut self) -> EmptyResult {
        Ok(())
    }

    /// Core run loop of the module
    ///
    /// The module is expected to return once the passed [`Heart`] dies and to report the
    /// reason as `Some(_)`. Returning `None` signals that the module completed its work.
    async fn run(&mut self, heart: &mut Heart) -> Result<Option<DeathReason>, BoxedError>;

    /// Shutdown hook executed after the core loop has terminated
    #[instrument(skip(self))]
    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if termination_reason.is_failure() {
            error!("Module terminated with an error")
        } else {
            info!("Module exited normally")
        }
    }
}

/// Reason why a module has terminated
#[derive(Error, Debug)]
pub enum ModuleTerminationReason {
    /// Startup routine threw an error
    #[error("startup routine threw an error")]
    StartupFailed(#[source] BoxedError),
    /// Core run loop threw an error
    #[error("error during operation")]
    OperationalError(#[source] BoxedError),
    /// [`Heart`] passed to the module died
    #[error("heart of module died: {0}")]
    HeartDied(DeathReason),
    /// Run loop exited cleanly
    #[error("run loop exited cleanly")]
    ExitedNormally,
    /// Timeout during startup or shutdown
    #[error("timeout during startup or shutdown")]
    Timeout,
}

impl ModuleTerminationReason {
    /// Whether the module terminated due to an error
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            ModuleTerminationReason::HeartDied(_) | ModuleTerminationReason::ExitedNormally
        )
    }
}

/// Runner for [`Module`] implementations
pub struct ModuleRunner {
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ModuleRunner {
    /// Creates a new instance with custom timeouts for the startup and shutdown hooks
    pub fn new(startup_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            startup_timeout,
            shutdown_timeout,
        }
    }
}

impl Default for ModuleRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(60))
    }
}

impl ModuleRunner {
    /// Executes a [`Module`] until it exits by calling the corresponding lifecycle functions in order
    /// and returns the reason why it terminated.
    #[instrument(skip(self, module, heart), fields(module_name = type_name::<M>()))]
    pub async fn run<M: Module + Send>(
        &self,
        module: &mut M,
        mut heart: Heart,
    ) -> ModuleTerminationReason {
        info!("Commencing module startup sequence");
        let startup = timeout(self.startup_timeout, module.pre_startup()).await;

        let mut termination_reason = match startup {
            Ok(Ok(_)) => self.run_loop(module, &mut heart).await,
            Ok(Err(error)) => {
                error!(?error, "Module startup sequence encountered an error");
                ModuleTerminationReason::StartupFailed(error)
            }
            Err(_) => {
                error!("Module startup sequence timed out");
                ModuleTerminationReason::Timeout
            }
        };

        info!("Commencing module shutdown sequence");
        let result = timeout(
            self.shutdown_timeout,
            module.post_shutdown(&termination_reason),
        )
        .await;

        if result.is_err() {
            error!("Module shutdown sequence timed out");
            if !termination_reason.is_failure() {
                termination_reason = ModuleTerminationReason::Timeout;
            }
        }

        termination_reason
    }

    #[instrument(skip(self, module, heart))]
    async fn run_loop<M: Module + Send>(
        &self,
        module: &mut M,
        heart: &mut Heart,
    ) -> ModuleTerminationReason {
        info!("Executing module run procedure");
        match module.run(heart).await {
            Ok(None) => {
                debug!("Module run procedure completed successfully");
                ModuleTerminationReason::ExitedNormally
            }
            Ok(Some(death_reason)) => {
                info!(?death_reason, "Heart of module died");
                ModuleTerminationReason::HeartDied(death_reason)
            }
            Err(error) => {
                info!(?error, "Module run procedure encountered an error");
                ModuleTerminationReason::OperationalError(error)
            }
        }
    }
}
