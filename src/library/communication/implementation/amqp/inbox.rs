use crate::library::communication::protocol::{
    ChannelId, Frame, FramePayload, LibraryError, Method, ReplyStatus, RpcReply,
};
use crate::library::communication::transport::Envelope;
use amqprs::callbacks::{ChannelCallback, ConnectionCallback};
use amqprs::channel::Channel;
use amqprs::connection::Connection;
use amqprs::error::Error as AmqpError;
use amqprs::{Ack, BasicProperties, Cancel, Close, CloseChannel, Nack, Return};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

/// Channel id under which connection level closes are recorded
const CONNECTION: ChannelId = 0;

enum Inbound {
    Delivery(Envelope),
    Frame {
        frame: Frame,
        content: Option<Vec<u8>>,
    },
}

#[derive(Default)]
struct InboxState {
    items: VecDeque<Inbound>,
    pending_content: Option<(ChannelId, Vec<u8>)>,
    closes: HashMap<ChannelId, ReplyStatus>,
    claimed: HashSet<ChannelId>,
}

/// Everything the library pushes at us between two calls
///
/// Deliveries, returned messages and broker initiated closes are kept in arrival order
/// so that they can be read back one at a time like the frame stream of a connection.
#[derive(Default)]
pub(super) struct Inbox {
    state: Mutex<InboxState>,
    notify: Notify,
}

impl Inbox {
    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, inbound: Inbound) {
        self.lock().items.push_back(inbound);
        self.notify.notify_one();
    }

    pub(super) fn deliver(&self, envelope: Envelope) {
        self.push(Inbound::Delivery(envelope));
    }

    fn returned(&self, channel: ChannelId, method: Method, content: Vec<u8>) {
        self.push(Inbound::Frame {
            frame: Frame::method(channel, method),
            content: Some(content),
        });
    }

    /// Records a close initiated by the broker, channel zero standing for the connection
    pub(super) fn closed(&self, channel: ChannelId, status: ReplyStatus) {
        let method = if channel == CONNECTION {
            Method::ConnectionClose(status.clone())
        } else {
            Method::ChannelClose(status.clone())
        };

        {
            let mut state = self.lock();
            if state.claimed.remove(&channel) {
                trace!(channel, "Close already reported by a failed call");
                return;
            }
            state.closes.insert(channel, status);
            state.items.push_back(Inbound::Frame {
                frame: Frame::method(channel, method),
                content: None,
            });
        }
        self.notify.notify_one();
    }

    /// Marks a channel close as reported before the library forwarded it
    pub(super) fn claim(&self, channel: ChannelId) {
        self.lock().claimed.insert(channel);
    }

    /// Forgets everything about a channel id that is about to be reused
    pub(super) fn reset(&self, channel: ChannelId) {
        let mut state = self.lock();
        state.closes.remove(&channel);
        state.claimed.remove(&channel);
    }

    /// Status of the close that ended the connection, if any
    pub(super) fn connection_close(&self) -> Option<ReplyStatus> {
        self.lock().closes.get(&CONNECTION).cloned()
    }

    /// Whether the broker closed the channel
    pub(super) fn is_closed(&self, channel: ChannelId) -> bool {
        self.lock().closes.contains_key(&channel)
    }

    /// Claims a channel close as the answer to a synchronous call
    ///
    /// The close is removed from the stream since the caller already learns about it.
    pub(super) fn take_close(&self, channel: ChannelId) -> Option<ReplyStatus> {
        let mut state = self.lock();
        let status = state.closes.remove(&channel)?;

        state.items.retain(|item| {
            !matches!(
                item,
                Inbound::Frame {
                    frame: Frame {
                        channel: closed,
                        payload: FramePayload::Method(Method::ChannelClose(_)),
                    },
                    ..
                } if *closed == channel
            )
        });

        Some(status)
    }

    /// Waits for the next delivery
    ///
    /// Anything else at the head of the stream is left in place and reported as
    /// [`LibraryError::UnexpectedState`].
    pub(super) async fn next_delivery(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Envelope, RpcReply> {
        loop {
            {
                let mut state = self.lock();
                match state.items.front() {
                    Some(Inbound::Delivery(_)) => {
                        if let Some(Inbound::Delivery(envelope)) = state.items.pop_front() {
                            return Ok(envelope);
                        }
                    }
                    Some(Inbound::Frame { .. }) => {
                        return Err(RpcReply::LibraryException(LibraryError::UnexpectedState))
                    }
                    None => {}
                }
            }

            self.wait(deadline)
                .await
                .map_err(RpcReply::LibraryException)?;
        }
    }

    /// Waits for the next item and hands it out as a frame
    pub(super) async fn next_frame(&self) -> Frame {
        loop {
            {
                let mut state = self.lock();
                match state.items.pop_front() {
                    Some(Inbound::Delivery(envelope)) => {
                        state.pending_content = Some((envelope.channel, envelope.body));
                        return Frame::method(
                            envelope.channel,
                            Method::BasicDeliver {
                                delivery_tag: envelope.delivery_tag,
                            },
                        );
                    }
                    Some(Inbound::Frame { frame, content }) => {
                        state.pending_content = content.map(|body| (frame.channel, body));
                        return frame;
                    }
                    None => {}
                }
            }

            self.notify.notified().await;
        }
    }

    /// Discards the content that belongs to the last frame handed out
    pub(super) fn read_message(&self, channel: ChannelId) -> RpcReply {
        let mut state = self.lock();

        match state.pending_content.take() {
            Some((pending, body)) if pending == channel => {
                trace!(channel, bytes = body.len(), "Discarded message content");
                RpcReply::Normal
            }
            other => {
                state.pending_content = other;
                RpcReply::LibraryException(LibraryError::UnexpectedState)
            }
        }
    }

    async fn wait(&self, deadline: Option<Instant>) -> Result<(), LibraryError> {
        match deadline {
            Some(deadline) => timeout_at(deadline, self.notify.notified())
                .await
                .map_err(|_| LibraryError::Timeout),
            None => {
                self.notify.notified().await;
                Ok(())
            }
        }
    }
}

/// Forwards connection events of the library into the inbox
pub(super) struct ConnectionEvents(pub(super) Arc<Inbox>);

#[async_trait]
impl ConnectionCallback for ConnectionEvents {
    async fn close(&mut self, _connection: &Connection, close: Close) -> Result<(), AmqpError> {
        let status = ReplyStatus::new(close.reply_code(), close.reply_text().to_string());
        warn!(%status, "Broker closed the connection");
        self.0.closed(CONNECTION, status);
        Ok(())
    }

    async fn blocked(&mut self, _connection: &Connection, reason: String) {
        warn!(%reason, "Broker blocked the connection");
    }

    async fn unblocked(&mut self, _connection: &Connection) {
        info!("Broker unblocked the connection");
    }
}

/// Forwards channel events of the library into the inbox
pub(super) struct ChannelEvents(pub(super) Arc<Inbox>);

#[async_trait]
impl ChannelCallback for ChannelEvents {
    async fn close(&mut self, channel: &Channel, close: CloseChannel) -> Result<(), AmqpError> {
        let status = ReplyStatus::new(close.reply_code(), close.reply_text().to_string());
        debug!(channel = channel.channel_id(), %status, "Broker closed the channel");
        self.0.closed(channel.channel_id(), status);
        Ok(())
    }

    async fn cancel(&mut self, channel: &Channel, cancel: Cancel) -> Result<(), AmqpError> {
        warn!(
            channel = channel.channel_id(),
            tag = %cancel.consumer_tag(),
            "Broker cancelled the consumer"
        );
        Ok(())
    }

    async fn flow(&mut self, _channel: &Channel, active: bool) -> Result<bool, AmqpError> {
        Ok(active)
    }

    async fn publish_ack(&mut self, _channel: &Channel, _ack: Ack) {}

    async fn publish_nack(&mut self, _channel: &Channel, _nack: Nack) {}

    async fn publish_return(
        &mut self,
        channel: &Channel,
        ret: Return,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let method = Method::BasicReturn {
            status: ReplyStatus::new(ret.reply_code(), ret.reply_text().to_string()),
            exchange: ret.exchange().to_string(),
            routing_key: ret.routing_key().to_string(),
        };
        self.0.returned(channel.channel_id(), method, content);
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::protocol::reply_code;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn envelope(delivery_tag: u64) -> Envelope {
        Envelope {
            channel: 1,
            delivery_tag,
            consumer_tag: "tag".into(),
            exchange: "x".into(),
            routing_key: "q".into(),
            redelivered: false,
            body: b"body".to_vec(),
        }
    }

    #[tokio::test]
    async fn hand_out_deliveries_in_arrival_order() {
        let inbox = Inbox::default();
        inbox.deliver(envelope(1));
        inbox.deliver(envelope(2));

        let first = inbox.next_delivery(None).await.unwrap();
        let second = inbox.next_delivery(None).await.unwrap();

        assert_eq!((first.delivery_tag, second.delivery_tag), (1, 2));
    }

    #[tokio::test]
    async fn time_out_without_deliveries() {
        let inbox = Inbox::default();

        let result = inbox
            .next_delivery(Some(Instant::now() + Duration::from_millis(20)))
            .await;

        assert_eq!(result, Err(RpcReply::LibraryException(LibraryError::Timeout)));
    }

    #[tokio::test]
    async fn stop_at_broker_closes() {
        let inbox = Inbox::default();
        let status = ReplyStatus::new(reply_code::PRECONDITION_FAILED, "unknown delivery tag");
        inbox.closed(1, status.clone());
        inbox.deliver(envelope(1));

        let result = inbox.next_delivery(None).await;

        assert_eq!(
            result,
            Err(RpcReply::LibraryException(LibraryError::UnexpectedState))
        );
        assert_eq!(
            inbox.next_frame().await,
            Frame::method(1, Method::ChannelClose(status))
        );
        assert_eq!(inbox.next_delivery(None).await.unwrap().delivery_tag, 1);
    }

    #[tokio::test]
    async fn drop_closes_claimed_by_a_call() {
        let inbox = Inbox::default();
        inbox.closed(3, ReplyStatus::new(reply_code::NOT_FOUND, "NOT_FOUND - no queue 'q'"));
        inbox.deliver(envelope(1));

        let status = inbox.take_close(3);

        assert_eq!(status.map(|s| s.code), Some(reply_code::NOT_FOUND));
        assert!(!inbox.is_closed(3));
        assert_eq!(inbox.next_delivery(None).await.unwrap().delivery_tag, 1);
    }

    #[tokio::test]
    async fn keep_returned_content_until_read() {
        let inbox = Inbox::default();
        let method = Method::BasicReturn {
            status: ReplyStatus::new(reply_code::NO_ROUTE, "NO_ROUTE"),
            exchange: "x".into(),
            routing_key: "nowhere".into(),
        };
        inbox.returned(1, method.clone(), b"lost".to_vec());

        assert_eq!(inbox.next_frame().await, Frame::method(1, method));
        assert_eq!(
            inbox.read_message(2),
            RpcReply::LibraryException(LibraryError::UnexpectedState)
        );
        assert_eq!(inbox.read_message(1), RpcReply::Normal);
    }

    #[tokio::test]
    async fn swallow_closes_that_a_call_already_reported() {
        let inbox = Inbox::default();
        inbox.claim(2);
        inbox.closed(2, ReplyStatus::new(reply_code::NOT_FOUND, "NOT_FOUND - no queue 'q'"));
        inbox.deliver(envelope(1));

        assert!(!inbox.is_closed(2));
        assert_eq!(inbox.next_delivery(None).await.unwrap().delivery_tag, 1);
    }

    #[test]
    fn remember_connection_closes() {
        let inbox = Inbox::default();
        inbox.closed(CONNECTION, ReplyStatus::new(320, "CONNECTION_FORCED - shutdown"));

        assert_eq!(inbox.connection_close().map(|s| s.code), Some(320));
    }
}
