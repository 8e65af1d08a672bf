//! Runnable modules, each taking one role in the request/response exchange

pub mod options;

pub mod client;
#[cfg(any(test, feature = "in-memory"))]
pub mod demo;
pub mod server;
