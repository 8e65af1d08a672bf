use super::protocol::{ChannelId, LibraryError, ReplyStatus};
use crate::library::BoxedError;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Entity closed by the broker in response to a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseScope {
    /// The whole connection was closed
    Connection,
    /// A single channel was closed
    Channel,
}

impl Display for CloseScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CloseScope::Connection => write!(f, "connection"),
            CloseScope::Channel => write!(f, "channel"),
        }
    }
}

/// Failure of a messaging operation
///
/// Every variant carries the context of the call that failed so that the
/// message reads like `<context>: <detail>`.
#[derive(Debug, Error)]
pub enum Error {
    /// The client library or the socket below it failed
    #[error("{context}: {kind} (status {})", .kind.code())]
    Transport {
        /// Operation that was attempted
        context: String,
        /// Library level failure
        kind: LibraryError,
    },
    /// Login was refused by the broker
    #[error("failed to log in as {user}: {text}")]
    Auth {
        /// User name that was used
        user: String,
        /// Explanation supplied by the broker or the library
        text: String,
    },
    /// A channel could not be opened or used
    #[error("channel {channel}: {reason}")]
    Channel {
        /// Affected channel
        channel: ChannelId,
        /// What went wrong
        reason: String,
    },
    /// An exchange, queue or binding could not be declared
    #[error("{context}: {source}")]
    Topology {
        /// Entity that was declared
        context: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
    /// The broker closed the channel or connection in response to a call
    #[error("{context}: server {scope} error {}, message: {}", .status.code, .status.text)]
    Broker {
        /// Operation that was attempted
        context: String,
        /// Entity that was closed
        scope: CloseScope,
        /// Reply code and text
        status: ReplyStatus,
    },
    /// The frame sequence did not match what the protocol allows
    #[error("{context}: {message}")]
    Protocol {
        /// Operation that was attempted
        context: String,
        /// Description of the violation
        message: String,
    },
    /// A message could not be serialized
    #[error("failed to serialize {what}")]
    Serialization {
        /// Kind of message
        what: &'static str,
        /// Codec failure
        #[source]
        source: BoxedError,
    },
    /// A message body could not be deserialized
    #[error("failed to deserialize {what}")]
    Deserialization {
        /// Kind of message
        what: &'static str,
        /// Codec failure
        #[source]
        source: BoxedError,
    },
    /// The broker closed the connection while a message was awaited
    #[error("{context}: connection closed by the broker ({status})")]
    ConnectionClosed {
        /// Operation that was attempted
        context: String,
        /// Reply code and text
        status: ReplyStatus,
    },
    /// The broker closed the channel while a message was awaited
    #[error("{context}: channel closed by the broker ({status})")]
    ChannelClosed {
        /// Operation that was attempted
        context: String,
        /// Reply code and text
        status: ReplyStatus,
    },
}

impl Error {
    /// Wraps a declaration failure
    pub fn topology(context: impl Into<String>, source: Error) -> Self {
        Error::Topology {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Reply code supplied by the broker, looking through topology wrappers
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Error::Broker { status, .. }
            | Error::ConnectionClosed { status, .. }
            | Error::ChannelClosed { status, .. } => Some(status.code),
            Error::Topology { source, .. } => source.reply_code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::protocol::reply_code;
    use pretty_assertions::assert_eq;

    #[test]
    fn prefix_messages_with_context() {
        let error = Error::Broker {
            context: "queue.declare".into(),
            scope: CloseScope::Channel,
            status: ReplyStatus::new(reply_code::PRECONDITION_FAILED, "inequivalent arg"),
        };

        assert_eq!(
            error.to_string(),
            "queue.declare: server channel error 406, message: inequivalent arg"
        );
    }

    #[test]
    fn include_library_status() {
        let error = Error::Transport {
            context: "open socket".into(),
            kind: LibraryError::SocketError,
        };

        assert_eq!(error.to_string(), "open socket: a socket error occurred (status -9)");
    }

    #[test]
    fn expose_nested_reply_codes() {
        let inner = Error::Broker {
            context: "exchange.declare".into(),
            scope: CloseScope::Channel,
            status: ReplyStatus::new(reply_code::PRECONDITION_FAILED, "inequivalent arg"),
        };
        let error = Error::topology("exchange defaultExchange", inner);

        assert_eq!(error.reply_code(), Some(reply_code::PRECONDITION_FAILED));
        assert_eq!(
            Error::Auth {
                user: "guest".into(),
                text: "denied".into()
            }
            .reply_code(),
            None
        );
    }
}
