use super::{Request, RequestProcessor, Response};
use crate::library::communication::codec::{Codec, WireFormat};
use crate::library::communication::error::Error;
use crate::library::communication::session::{Endpoint, Session};
use crate::library::communication::transport::Envelope;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Server side of the request/response exchange
///
/// Consumes the request queue exclusively, so at most one responder serves a topology
/// at any given time. Each request is acknowledged only after its response has been
/// published. A request that fails to decode, or whose response can not be encoded or
/// published, remains unacknowledged and returns to the queue once the connection closes.
pub struct Responder<P, C = WireFormat> {
    session: Session,
    processor: P,
    codec: C,
}

impl<P, C> Responder<P, C>
where
    P: RequestProcessor,
    C: Codec,
{
    /// Starts consuming the request queue
    #[instrument(skip_all)]
    pub async fn open(mut session: Session, processor: P, codec: C) -> Result<Self, Error> {
        if let Err(error) = session.consume(Endpoint::Request, true).await {
            if let Err(close_error) = session.close().await {
                warn!(%close_error, "Unable to close session after failed consume");
            }
            return Err(error);
        }

        Ok(Self {
            session,
            processor,
            codec,
        })
    }

    /// Underlying session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Waits up to `timeout` for the next request
    pub async fn poll(&self, timeout: Duration) -> Result<Option<Envelope>, Error> {
        self.session.poll(Some(timeout)).await
    }

    /// Processes a request and publishes the correlated response
    pub async fn respond(&self, envelope: Envelope) -> Result<(), Error> {
        let request: P::Request =
            self.codec
                .decode(&envelope.body)
                .map_err(|source| Error::Deserialization {
                    what: "request",
                    source,
                })?;

        let (id, value) = request.into_parts();
        let result = self.processor.process(value);
        let response = <P::Request as Request>::Response::new(id, result);

        let body = self
            .codec
            .encode(&response)
            .map_err(|source| Error::Serialization {
                what: "response",
                source,
            })?;

        self.session.publish(Endpoint::Response, &body).await?;
        debug!(id = %response.id(), "Published response");

        self.session.ack(envelope).await
    }

    /// Serves at most one request, returns whether one arrived within the timeout
    pub async fn process_request_response_cycle(&self, timeout: Duration) -> Result<bool, Error> {
        match self.poll(timeout).await? {
            Some(envelope) => {
                self.respond(envelope).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Closes the underlying session
    pub async fn close(self) -> Result<(), Error> {
        self.session.close().await
    }
}
