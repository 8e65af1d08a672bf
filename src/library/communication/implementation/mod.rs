//! Implementations of the [`Transport`](super::Transport) trait

pub mod amqp;
#[cfg(any(test, feature = "in-memory"))]
pub mod memory;
