//! Broker living inside the process
//!
//! Stands in for a RabbitMQ instance wherever a real one is not available, most notably in tests
//! and in the demo. Every client connection is a [`MemoryTransport`] sharing the state of one
//! [`MemoryBroker`].

mod broker;
#[cfg(test)]
mod recording;
mod transport;

pub use broker::{BrokerConfig, BrokerStatistics, DispatchOrder, MemoryBroker};
#[cfg(test)]
pub(crate) use recording::{CallLog, RecordingTransport};
pub use transport::MemoryTransport;
