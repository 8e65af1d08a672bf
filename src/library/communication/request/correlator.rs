use super::{CorrelationId, Request, Response, ResultOf};
use crate::library::communication::codec::{Codec, WireFormat};
use crate::library::communication::error::Error;
use crate::library::communication::session::{Endpoint, Session};
use std::marker::PhantomData;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Result of a single poll for a response
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseOutcome<T> {
    /// The response to our request arrived and was acknowledged
    Accepted(T),
    /// A response for somebody else arrived and was put back into the queue
    Requeued(CorrelationId),
    /// Nothing arrived before the timeout expired
    Empty,
}

impl<T> ResponseOutcome<T> {
    /// Returns the result if the response was accepted
    pub fn accepted(self) -> Option<T> {
        match self {
            ResponseOutcome::Accepted(result) => Some(result),
            _ => None,
        }
    }
}

/// Client side of the request/response exchange
///
/// Publishes requests tagged with its [`CorrelationId`] and filters the shared response
/// queue for the matching responses. Responses for other participants are rejected with
/// requeue and thus remain available to everybody else.
pub struct Correlator<R, C = WireFormat> {
    session: Session,
    codec: C,
    id: CorrelationId,
    request: PhantomData<fn() -> R>,
}

impl<R, C> Correlator<R, C>
where
    R: Request,
    C: Codec,
{
    /// Starts consuming the response queue using a freshly generated id
    pub async fn open(session: Session, codec: C) -> Result<Self, Error> {
        Self::with_id(session, codec, CorrelationId::generate()).await
    }

    /// Starts consuming the response queue using the given id
    ///
    /// The id must not be used by any other participant at the same time.
    #[instrument(skip(session, codec))]
    pub async fn with_id(
        mut session: Session,
        codec: C,
        id: CorrelationId,
    ) -> Result<Self, Error> {
        if let Err(error) = session.consume(Endpoint::Response, false).await {
            if let Err(close_error) = session.close().await {
                warn!(%close_error, "Unable to close session after failed consume");
            }
            return Err(error);
        }

        Ok(Self {
            session,
            codec,
            id,
            request: PhantomData,
        })
    }

    /// Id attached to every request
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Underlying session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Publishes a request carrying the given value
    pub async fn send_request(&self, value: R::Value) -> Result<(), Error> {
        let request = R::new(self.id.clone(), value);
        let body = self
            .codec
            .encode(&request)
            .map_err(|source| Error::Serialization {
                what: "request",
                source,
            })?;

        self.session.publish(Endpoint::Request, &body).await?;
        debug!(id = %self.id, "Sent request");

        Ok(())
    }

    /// Polls the response queue once
    ///
    /// A body that can not be decoded is neither acknowledged nor rejected and stays
    /// with the broker until the connection closes.
    pub async fn get_response(
        &self,
        timeout: Duration,
    ) -> Result<ResponseOutcome<ResultOf<R>>, Error> {
        let envelope = match self.session.poll(Some(timeout)).await? {
            Some(envelope) => envelope,
            None => return Ok(ResponseOutcome::Empty),
        };

        let response: R::Response =
            self.codec
                .decode(&envelope.body)
                .map_err(|source| Error::Deserialization {
                    what: "response",
                    source,
                })?;

        if response.id() == &self.id {
            self.session.ack(envelope).await?;
            let (_, result) = response.into_parts();
            info!(id = %self.id, "Received response");
            Ok(ResponseOutcome::Accepted(result))
        } else {
            let (foreign, _) = response.into_parts();
            self.session.reject(envelope, true).await?;
            debug!(id = %self.id, %foreign, "Requeued foreign response");
            Ok(ResponseOutcome::Requeued(foreign))
        }
    }

    /// Polls until the response arrives or the deadline passes
    ///
    /// Returns `None` once the deadline is exceeded. Without a deadline this only
    /// returns when the response arrives or an error occurs.
    pub async fn await_response(
        &self,
        poll_timeout: Duration,
        deadline: Option<Duration>,
    ) -> Result<Option<ResultOf<R>>, Error> {
        let deadline = deadline.map(|deadline| Instant::now() + deadline);

        loop {
            if let ResponseOutcome::Accepted(result) = self.get_response(poll_timeout).await? {
                return Ok(Some(result));
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    debug!(id = %self.id, "Deadline for response exceeded");
                    return Ok(None);
                }
            }
        }
    }

    /// Closes the underlying session
    pub async fn close(self) -> Result<(), Error> {
        self.session.close().await
    }
}
