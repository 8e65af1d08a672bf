//! Translation of raw broker replies into [`Error`]s
//!
//! Synchronous calls are checked with [`validate`], fire-and-forget calls with [`check_status`].
//! A consume call that stumbled over a frame which is not part of a delivery leaves the
//! stream in an intermediate state; [`drain_after_consume`] reads that frame and decides
//! whether the interruption was harmless.

use super::error::{CloseScope, Error};
use super::protocol::{FramePayload, LibraryError, Method, RpcReply};
use super::transport::FrameSource;
use super::warning::{Warning, WarningLog};
use tracing::{debug, error};

/// Converts the reply of a synchronous call into a result
pub fn validate(reply: &RpcReply, context: &str) -> Result<(), Error> {
    let error = match reply {
        RpcReply::Normal => return Ok(()),
        RpcReply::None => Error::Protocol {
            context: context.to_owned(),
            message: "missing RPC reply type".to_owned(),
        },
        RpcReply::LibraryException(kind) => Error::Transport {
            context: context.to_owned(),
            kind: *kind,
        },
        RpcReply::ServerException(Method::ConnectionClose(status)) => Error::Broker {
            context: context.to_owned(),
            scope: CloseScope::Connection,
            status: status.clone(),
        },
        RpcReply::ServerException(Method::ChannelClose(status)) => Error::Broker {
            context: context.to_owned(),
            scope: CloseScope::Channel,
            status: status.clone(),
        },
        RpcReply::ServerException(method) => Error::Protocol {
            context: context.to_owned(),
            message: format!("unknown server error, method id {}", method.id()),
        },
        RpcReply::Unrecognized(reply_type) => Error::Protocol {
            context: context.to_owned(),
            message: format!("unknown RPC reply type {}", reply_type),
        },
    };

    error!(%error, "Broker call failed");
    Err(error)
}

/// Converts the status of a fire-and-forget call into a result
pub fn check_status(status: Result<(), LibraryError>, context: &str) -> Result<(), Error> {
    status.map_err(|kind| {
        let error = Error::Transport {
            context: context.to_owned(),
            kind,
        };
        error!(%error, "Broker call failed");
        error
    })
}

/// Classifies the reply of an unsuccessful consume call
///
/// Only [`LibraryError::UnexpectedState`] leads to frame draining, every other reply is
/// passed on to [`validate`]. The drained frame is classified as follows:
///
/// - `basic.return` records a [`Warning::MessageReturned`] and discards the returned content
/// - `basic.ack` and non-method frames are ignored
/// - `channel.close` and `connection.close` become [`Error::ChannelClosed`] and [`Error::ConnectionClosed`]
/// - any other method is a protocol violation
pub async fn drain_after_consume<F>(
    source: &F,
    reply: RpcReply,
    context: &str,
    warnings: &WarningLog,
) -> Result<(), Error>
where
    F: FrameSource + ?Sized,
{
    if reply != RpcReply::LibraryException(LibraryError::UnexpectedState) {
        return validate(&reply, context);
    }

    let frame = source.wait_frame().await.map_err(|kind| {
        let error = Error::Transport {
            context: format!("{}: failed to wait for the next frame", context),
            kind,
        };
        error!(%error, "Unable to drain interrupted consume");
        error
    })?;

    let method = match frame.payload {
        FramePayload::Method(method) => method,
        payload => {
            debug!(channel = frame.channel, ?payload, "Skipping non-method frame");
            return Ok(());
        }
    };

    match method {
        Method::BasicReturn {
            status,
            exchange,
            routing_key,
        } => {
            warnings.record(Warning::MessageReturned {
                exchange,
                routing_key,
                status,
            });

            let reply = source.read_message(frame.channel).await;
            if reply.is_normal() {
                Ok(())
            } else {
                let error = Error::Protocol {
                    context: context.to_owned(),
                    message: "failed to read returned message".to_owned(),
                };
                error!(%error, ?reply, "Unable to discard returned message");
                Err(error)
            }
        }
        Method::BasicAck { delivery_tag, .. } => {
            debug!(delivery_tag, "Ignoring publisher confirm");
            Ok(())
        }
        Method::ChannelClose(status) => Err(Error::ChannelClosed {
            context: context.to_owned(),
            status,
        }),
        Method::ConnectionClose(status) => Err(Error::ConnectionClosed {
            context: context.to_owned(),
            status,
        }),
        other => {
            let error = Error::Protocol {
                context: context.to_owned(),
                message: format!("unexpected method was received, id: {}", other.id()),
            };
            error!(%error, "Unable to drain interrupted consume");
            Err(error)
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::protocol::{
        reply_code, ChannelId, Frame, MethodId, ReplyStatus,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedFrames {
        frames: Mutex<VecDeque<Result<Frame, LibraryError>>>,
        content: RpcReply,
        reads: Mutex<Vec<ChannelId>>,
    }

    impl ScriptedFrames {
        fn new(frame: Result<Frame, LibraryError>, content: RpcReply) -> Self {
            Self {
                frames: Mutex::new(vec![frame].into()),
                content,
                reads: Mutex::new(Vec::new()),
            }
        }

        fn method(method: Method) -> Self {
            Self::new(Ok(Frame::method(1, method)), RpcReply::Normal)
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedFrames {
        async fn wait_frame(&self) -> Result<Frame, LibraryError> {
            self.frames
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LibraryError::ConnectionClosed))
        }

        async fn read_message(&self, channel: ChannelId) -> RpcReply {
            self.reads.lock().unwrap().push(channel);
            self.content.clone()
        }
    }

    fn unexpected_state() -> RpcReply {
        RpcReply::LibraryException(LibraryError::UnexpectedState)
    }

    fn returned() -> Method {
        Method::BasicReturn {
            status: ReplyStatus::new(reply_code::NO_ROUTE, "NO_ROUTE"),
            exchange: "defaultExchange".into(),
            routing_key: "nowhere".into(),
        }
    }

    #[test]
    fn accept_normal_replies() {
        assert!(validate(&RpcReply::Normal, "test").is_ok());
    }

    #[test]
    fn reject_missing_reply_types() {
        let result = validate(&RpcReply::None, "test");

        assert!(matches!(
            result,
            Err(Error::Protocol { message, .. }) if message == "missing RPC reply type"
        ));
    }

    #[test]
    fn report_library_failures_as_transport_errors() {
        let result = validate(
            &RpcReply::LibraryException(LibraryError::SocketError),
            "test",
        );

        assert!(matches!(
            result,
            Err(Error::Transport {
                kind: LibraryError::SocketError,
                ..
            })
        ));
    }

    #[test]
    fn report_close_methods_as_broker_errors() {
        let status = ReplyStatus::new(reply_code::ACCESS_REFUSED, "ACCESS_REFUSED");

        let connection = validate(
            &RpcReply::ServerException(Method::ConnectionClose(status.clone())),
            "login",
        );
        let channel = validate(
            &RpcReply::ServerException(Method::ChannelClose(status.clone())),
            "queue.declare",
        );

        assert!(matches!(
            connection,
            Err(Error::Broker { scope: CloseScope::Connection, status: ref s, .. }) if *s == status
        ));
        assert!(matches!(
            channel,
            Err(Error::Broker { scope: CloseScope::Channel, status: ref s, .. }) if *s == status
        ));
    }

    #[test]
    fn report_unknown_server_methods() {
        let result = validate(
            &RpcReply::ServerException(Method::Other(MethodId(0x003C_0028))),
            "test",
        );

        assert_eq!(
            result.unwrap_err().to_string(),
            "test: unknown server error, method id 0x3c0028"
        );
    }

    #[test]
    fn reject_unknown_reply_types() {
        let result = validate(&RpcReply::Unrecognized(7), "test");

        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[test]
    fn map_publish_status() {
        assert!(check_status(Ok(()), "publish").is_ok());
        assert!(matches!(
            check_status(Err(LibraryError::ConnectionClosed), "publish"),
            Err(Error::Transport {
                kind: LibraryError::ConnectionClosed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn validate_other_consume_failures_directly() {
        let source = ScriptedFrames::method(returned());
        let warnings = WarningLog::default();

        let result = drain_after_consume(
            &source,
            RpcReply::LibraryException(LibraryError::HeartbeatTimeout),
            "consume",
            &warnings,
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::Transport {
                kind: LibraryError::HeartbeatTimeout,
                ..
            })
        ));
        assert_eq!(source.frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn discard_returned_messages_with_warning() {
        let source = ScriptedFrames::method(returned());
        let warnings = WarningLog::default();

        let result = drain_after_consume(&source, unexpected_state(), "consume", &warnings).await;

        assert!(result.is_ok());
        assert_eq!(*source.reads.lock().unwrap(), vec![1]);
        assert!(matches!(
            warnings.snapshot().as_slice(),
            [Warning::MessageReturned { routing_key, .. }] if routing_key == "nowhere"
        ));
    }

    #[tokio::test]
    async fn fail_when_returned_message_is_unreadable() {
        let source = ScriptedFrames::new(
            Ok(Frame::method(1, returned())),
            RpcReply::LibraryException(LibraryError::BadAmqpData),
        );
        let warnings = WarningLog::default();

        let result = drain_after_consume(&source, unexpected_state(), "consume", &warnings).await;

        assert!(
            matches!(result, Err(Error::Protocol { message, .. }) if message == "failed to read returned message")
        );
    }

    #[tokio::test]
    async fn report_closed_channels_and_connections() {
        let warnings = WarningLog::default();
        let status = ReplyStatus::new(reply_code::NOT_FOUND, "NOT_FOUND");

        let channel = ScriptedFrames::method(Method::ChannelClose(status.clone()));
        let connection = ScriptedFrames::method(Method::ConnectionClose(status.clone()));

        assert!(matches!(
            drain_after_consume(&channel, unexpected_state(), "consume", &warnings).await,
            Err(Error::ChannelClosed { .. })
        ));
        assert!(matches!(
            drain_after_consume(&connection, unexpected_state(), "consume", &warnings).await,
            Err(Error::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn ignore_publisher_confirms_and_content_frames() {
        let warnings = WarningLog::default();
        let confirm = ScriptedFrames::method(Method::BasicAck {
            delivery_tag: 3,
            multiple: false,
        });
        let heartbeat = ScriptedFrames::new(
            Ok(Frame {
                channel: 0,
                payload: FramePayload::Heartbeat,
            }),
            RpcReply::Normal,
        );

        assert!(
            drain_after_consume(&confirm, unexpected_state(), "consume", &warnings)
                .await
                .is_ok()
        );
        assert!(
            drain_after_consume(&heartbeat, unexpected_state(), "consume", &warnings)
                .await
                .is_ok()
        );
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn reject_unexpected_methods() {
        let warnings = WarningLog::default();
        let source = ScriptedFrames::method(Method::Other(MethodId(0x003C_001F)));

        let result = drain_after_consume(&source, unexpected_state(), "consume", &warnings).await;

        assert_eq!(
            result.unwrap_err().to_string(),
            "consume: unexpected method was received, id: 0x3c001f"
        );
    }

    #[tokio::test]
    async fn report_unreadable_frames_as_transport_errors() {
        let warnings = WarningLog::default();
        let source = ScriptedFrames::new(Err(LibraryError::SocketError), RpcReply::Normal);

        let result = drain_after_consume(&source, unexpected_state(), "consume", &warnings).await;

        assert!(matches!(
            result,
            Err(Error::Transport {
                kind: LibraryError::SocketError,
                ..
            })
        ));
    }
}
