//! Structures to keep the process alive until some event occurs

use futures::{
    channel::mpsc::{channel, Receiver, Sender},
    future,
    prelude::*,
    select,
};
use std::{
    fmt,
    fmt::{Error as FmtError, Formatter},
    time::{Duration, Instant},
};
use tokio::signal::ctrl_c;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Reason why the heart stopped beating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    /// Internal kill signal has been sent
    Killed(String),
    /// Predetermined lifetime has been exceeded
    LifetimeExceeded,
    /// SIGINT or other process-external cause
    Terminated,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, w: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            DeathReason::Killed(reason) => write!(w, "Killed ({})", reason),
            DeathReason::LifetimeExceeded => write!(w, "Lifetime was exceeded"),
            DeathReason::Terminated => write!(w, "Terminated due to external signal"),
        }
    }
}

/// Action to a heart
#[derive(Debug)]
pub enum HeartInteraction {
    /// Kill it for the given reason
    Kill(String),
    /// Stop it because the process has been asked to terminate
    Terminate,
}

impl From<HeartInteraction> for DeathReason {
    fn from(interaction: HeartInteraction) -> Self {
        match interaction {
            HeartInteraction::Kill(reason) => DeathReason::Killed(reason),
            HeartInteraction::Terminate => DeathReason::Terminated,
        }
    }
}

/// Lifecycle management struct that can be used to keep the application alive
///
/// The heart can either be awaited through [`Heart::death`] or inspected without blocking
/// through [`Heart::check`], the latter being what loops use between two iterations.
pub struct Heart {
    /// Receiver for interactions sent by heart stones
    rx: Receiver<HeartInteraction>,
    /// Set once every linked stone has been dropped
    orphaned: bool,
    /// Point in time when the heart started beating
    birth: Instant,
    /// Maximum lifetime duration
    lifetime: Option<Duration>,
}

impl Heart {
    /// Creates a new heart and linked stone with no lifetime limit
    pub fn new() -> (Self, HeartStone) {
        Heart::internal_new(None)
    }

    /// Creates a new heart with no lifetime and discards the linked stone
    pub fn without_heart_stone() -> Self {
        Heart::internal_new(None).0
    }

    /// Creates a new heart and linked stone with a lifetime
    pub fn with_lifetime(lifetime: Duration) -> (Self, HeartStone) {
        Heart::internal_new(Some(lifetime))
    }

    /// Returns the reason of death if the heart stopped beating, never blocks
    pub fn check(&mut self) -> Option<DeathReason> {
        if !self.orphaned {
            match self.rx.next().now_or_never() {
                Some(Some(interaction)) => return Some(interaction.into()),
                Some(None) => self.orphaned = true,
                None => {}
            }
        }

        match self.lifetime {
            Some(lifetime) if self.birth.elapsed() >= lifetime => {
                Some(DeathReason::LifetimeExceeded)
            }
            _ => None,
        }
    }

    /// Future that waits until the heart dies for the returned reason
    pub async fn death(&mut self) -> DeathReason {
        let mut age_future = match self.lifetime {
            Some(lifetime) => sleep(lifetime.saturating_sub(self.birth.elapsed())).boxed(),
            None => future::pending::<()>().boxed(),
        }
        .fuse();

        debug!("Heart starts beating");

        loop {
            let mut interaction = if self.orphaned {
                future::pending::<Option<HeartInteraction>>().boxed()
            } else {
                self.rx.next().boxed()
            }
            .fuse();

            select! {
                interaction = interaction => match interaction {
                    Some(interaction) => return interaction.into(),
                    None => self.orphaned = true,
                },
                () = age_future => return DeathReason::LifetimeExceeded,
            };
        }
    }

    fn internal_new(lifetime: Option<Duration>) -> (Self, HeartStone) {
        if let Some(lifetime) = lifetime {
            info!("Lifetime set to {} seconds", lifetime.as_secs());
        }

        let (tx, rx) = channel(2);
        let heart = Self {
            rx,
            orphaned: false,
            birth: Instant::now(),
            lifetime,
        };
        let stone = HeartStone::new(tx);

        (heart, stone)
    }
}

/// Remote controller for the heart
#[derive(Clone)]
pub struct HeartStone {
    remote: Sender<HeartInteraction>,
}

impl HeartStone {
    fn new(remote: Sender<HeartInteraction>) -> Self {
        Self { remote }
    }

    /// Kill the associated heart
    pub async fn kill(&mut self, reason: String) {
        self.send(HeartInteraction::Kill(reason)).await;
    }

    /// Stop the associated heart due to an external signal
    pub async fn terminate(&mut self) {
        self.send(HeartInteraction::Terminate).await;
    }

    /// Spawns a task that terminates the associated heart on SIGINT or SIGTERM
    pub fn terminate_on_signal(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            termination_signal().await;
            info!("Received termination signal");
            self.terminate().await;
        })
    }

    async fn send(&mut self, interaction: HeartInteraction) {
        if let Err(e) = self.remote.send(interaction).await {
            error!("Failed to interact with Heart: {}", e);
        }
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            warn!(%error, "Unable to listen for SIGTERM");
            if let Err(error) = ctrl_c().await {
                warn!(%error, "Unable to listen for SIGINT");
                future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {},
        result = ctrl_c() => {
            if let Err(error) = result {
                warn!(%error, "Unable to listen for SIGINT");
                sigterm.recv().await;
            }
        },
    };
}

#[cfg(not(unix))]
async fn termination_signal() {
    if let Err(error) = ctrl_c().await {
        warn!(%error, "Unable to listen for SIGINT");
        future::pending::<()>().await;
    }
}
