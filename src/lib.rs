//! This library crate contains everything needed to exchange correlated requests and responses
//! over a shared AMQP broker.
//!
//! Submodules have been introduced to split responsibilities. Each module has a specific focus
//! and they together form a chain of dependencies from the low-level [`library`], over the
//! [`domain`] specific messages, through the executable [`harness`], up to the high-level
//! [`modules`](module) implementing the client and server roles.

#![deny(missing_docs)]

pub mod domain;
pub mod harness;
pub mod library;
pub mod module;
