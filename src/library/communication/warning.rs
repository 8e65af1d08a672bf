use super::protocol::ReplyStatus;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Non-fatal condition encountered while talking to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// A resource was released after its connection was gone
    StaleResource {
        /// Description of the resource
        resource: String,
    },
    /// A mandatory message could not be routed and came back
    MessageReturned {
        /// Exchange the message was published to
        exchange: String,
        /// Routing key the message was published with
        routing_key: String,
        /// Reason supplied by the broker
        status: ReplyStatus,
    },
    /// Releasing a resource on the broker failed
    TeardownFailed {
        /// Description of the resource
        resource: String,
        /// What went wrong
        reason: String,
    },
}

impl Display for Warning {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Warning::StaleResource { resource } => write!(
                f,
                "{} outlived its connection and was not released",
                resource
            ),
            Warning::MessageReturned {
                exchange,
                routing_key,
                status,
            } => write!(
                f,
                "the message was returned back from {} with routing key {} ({})",
                exchange, routing_key, status
            ),
            Warning::TeardownFailed { resource, reason } => {
                write!(f, "failed to release {}: {}", resource, reason)
            }
        }
    }
}

/// Shared, append-only record of [`Warning`]s
///
/// Cloning yields a handle to the same log.
#[derive(Debug, Clone, Default)]
pub struct WarningLog(Arc<Mutex<Vec<Warning>>>);

impl WarningLog {
    /// Logs the warning and appends it
    pub fn record(&self, warning: Warning) {
        warn!(%warning, "Recorded warning");
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(warning);
    }

    /// Copy of all warnings recorded so far
    pub fn snapshot(&self) -> Vec<Warning> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of warnings recorded so far
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no warning has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
