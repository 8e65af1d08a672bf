//! Correlated request and response exchange on top of a [`Session`](super::Session)
//!
//! Requests travel through the request queue to a single [`Responder`]. Every response
//! is published to the shared response queue from which any number of [`Correlator`]s
//! consume competitively. A correlator only accepts responses carrying its own
//! [`CorrelationId`] and puts every other one back so that its rightful owner may
//! receive it on one of the following polls. Delivery to the owner is therefore
//! eventual and depends on how the broker distributes messages between consumers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

mod correlator;
mod responder;

pub use correlator::{Correlator, ResponseOutcome};
pub use responder::Responder;

/// Token matching a response to the participant that sent the request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a new, globally unique identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_hyphenated().to_string())
    }

    /// Textual representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message sent to the request queue
pub trait Request: Serialize + DeserializeOwned + Send + Sync {
    /// Argument carried next to the correlation id
    type Value: Send;

    /// Message expected in return
    type Response: Response;

    /// Assembles a request from its parts
    fn new(id: CorrelationId, value: Self::Value) -> Self;

    /// Splits the request into its parts
    fn into_parts(self) -> (CorrelationId, Self::Value);
}

/// Message sent to the response queue
pub trait Response: Serialize + DeserializeOwned + Send + Sync {
    /// Outcome carried next to the correlation id
    type Result: Send;

    /// Assembles a response from its parts
    fn new(id: CorrelationId, result: Self::Result) -> Self;

    /// Id of the request this response belongs to
    fn id(&self) -> &CorrelationId;

    /// Splits the response into its parts
    fn into_parts(self) -> (CorrelationId, Self::Result);
}

/// Result type of the response belonging to a request type
pub type ResultOf<R> = <<R as Request>::Response as Response>::Result;

/// Computes the result for a request
///
/// Processing has to be free of side effects. The same request may be processed
/// more than once when the broker redelivers it.
pub trait RequestProcessor: Send + Sync {
    /// Type of request to process
    type Request: Request;

    /// Handler for request values
    fn process(&self, value: <Self::Request as Request>::Value) -> ResultOf<Self::Request>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::library::communication::implementation::memory::{
        CallLog, MemoryBroker, RecordingTransport,
    };
    use crate::library::communication::{Session, SessionConfig, WarningLog};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    pub struct Question {
        pub id: CorrelationId,
        pub value: i32,
    }

    impl Request for Question {
        type Value = i32;
        type Response = Answer;

        fn new(id: CorrelationId, value: i32) -> Self {
            Self { id, value }
        }

        fn into_parts(self) -> (CorrelationId, i32) {
            (self.id, self.value)
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    pub struct Answer {
        pub id: CorrelationId,
        pub result: i64,
    }

    impl Response for Answer {
        type Result = i64;

        fn new(id: CorrelationId, result: i64) -> Self {
            Self { id, result }
        }

        fn id(&self) -> &CorrelationId {
            &self.id
        }

        fn into_parts(self) -> (CorrelationId, i64) {
            (self.id, self.result)
        }
    }

    pub struct Negate;

    impl RequestProcessor for Negate {
        type Request = Question;

        fn process(&self, value: i32) -> i64 {
            -i64::from(value)
        }
    }

    pub async fn session(broker: &MemoryBroker) -> Session {
        Session::open(
            broker.transport(),
            &SessionConfig::default(),
            WarningLog::default(),
        )
        .await
        .unwrap()
    }

    /// Session whose transport calls are logged, failing the named call
    pub async fn recorded_session(
        broker: &MemoryBroker,
        failing: &'static str,
    ) -> (Session, CallLog) {
        let transport = RecordingTransport::new(broker.transport()).failing(failing);
        let calls = transport.calls();
        let session = Session::open(transport, &SessionConfig::default(), WarningLog::default())
            .await
            .unwrap();

        (session, calls)
    }
}


#[cfg(test)]
mod scenarios;
