use crate::library::communication::request::{CorrelationId, Request, RequestProcessor, Response};
use serde::{Deserialize, Serialize};

/// Computation performed by the server for every request
///
/// Widens before doubling so that the full `i32` range maps without overflow.
pub fn transform(value: i32) -> i64 {
    2 * i64::from(value)
}

/// Request asking the server to [`transform`] a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeRequest {
    /// Correlation id of the client
    pub id: CorrelationId,
    /// Input of the computation
    #[serde(rename = "req")]
    pub value: i32,
}

/// Response to a [`ComputeRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeResponse {
    /// Correlation id copied from the request
    pub id: CorrelationId,
    /// Output of the computation
    #[serde(rename = "res")]
    pub result: i64,
}

impl Request for ComputeRequest {
    type Value = i32;
    type Response = ComputeResponse;

    fn new(id: CorrelationId, value: i32) -> Self {
        Self { id, value }
    }

    fn into_parts(self) -> (CorrelationId, i32) {
        (self.id, self.value)
    }
}

impl Response for ComputeResponse {
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

/// [`RequestProcessor`] applying [`transform`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Doubler;

impl RequestProcessor for Doubler {
    type Request = ComputeRequest;

    fn process(&self, value: i32) -> i64 {
        transform(value)
    }
}
