use super::{DeathReason, Heart};
use crate::library::BoxedError;
use async_trait::async_trait;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Phase of a [`PollLoop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Between two iterations
    Idle,
    /// Waiting for the next item
    Polling,
    /// Handling an item
    Dispatching,
    /// Terminated, no further iterations follow
    Stopped,
}

/// Reason why a [`PollLoop`] stopped without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The heart of the loop died
    HeartDied(DeathReason),
    /// The handler requested the loop to stop
    Finished,
}

/// Work performed by a [`PollLoop`]
#[async_trait]
pub trait PollHandler: Send {
    /// Item produced by a successful poll
    type Item: Send;

    /// Waits up to `timeout` for the next item
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Self::Item>, BoxedError>;

    /// Handles an item and decides whether the loop continues
    async fn dispatch(&mut self, item: Self::Item) -> Result<ControlFlow<()>, BoxedError>;
}

/// Repeated bounded polling with cooperative cancellation
///
/// Each iteration moves from [`LoopState::Idle`] to [`LoopState::Polling`] and, if an item
/// arrived, to [`LoopState::Dispatching`]. The [`Heart`] is only consulted between iterations,
/// so stopping the loop takes up to one poll timeout plus the time spent dispatching.
/// Any error ends the loop in [`LoopState::Stopped`] and is handed to the caller.
pub struct PollLoop {
    poll_timeout: Duration,
    state: watch::Sender<LoopState>,
    observer: watch::Receiver<LoopState>,
}

impl PollLoop {
    /// Creates a new loop that polls with the given timeout
    pub fn new(poll_timeout: Duration) -> Self {
        let (state, observer) = watch::channel(LoopState::Idle);

        Self {
            poll_timeout,
            state,
            observer,
        }
    }

    /// Current phase
    pub fn state(&self) -> LoopState {
        *self.observer.borrow()
    }

    /// Receiver that observes phase changes
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.observer.clone()
    }

    fn transition(&self, state: LoopState) {
        trace!(?state, "Poll loop transition");
        // The loop keeps its own receiver, so the channel never closes.
        self.state.send(state).ok();
    }

    /// Drives the handler until it finishes, fails, or the heart dies
    pub async fn run<H: PollHandler>(
        &self,
        handler: &mut H,
        heart: &mut Heart,
    ) -> Result<StopReason, BoxedError> {
        let reason = self.iterate(handler, heart).await;
        self.transition(LoopState::Stopped);

        if let Ok(reason) = &reason {
            debug!(?reason, "Poll loop stopped");
        }

        reason
    }

    async fn iterate<H: PollHandler>(
        &self,
        handler: &mut H,
        heart: &mut Heart,
    ) -> Result<StopReason, BoxedError> {
        loop {
            if let Some(reason) = heart.check() {
                return Ok(StopReason::HeartDied(reason));
            }

            self.transition(LoopState::Polling);
            if let Some(item) = handler.poll(self.poll_timeout).await? {
                self.transition(LoopState::Dispatching);
                if handler.dispatch(item).await?.is_break() {
                    return Ok(StopReason::Finished);
                }
            }

            self.transition(LoopState::Idle);
        }
    }
}
