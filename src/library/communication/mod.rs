//! Request and response exchange over an AMQP 0-9-1 broker
//!
//! The module is layered bottom-up. A [`Transport`] is the raw capability of a client
//! library bound to one broker connection; it answers with the loosely typed replies
//! found in [`protocol`]. The [`validation`] functions turn those replies into
//! [`Error`]s. A [`Connection`] owns the transport and hands out [`Channel`]s which, like
//! the [`topology`] entities declared through them, only keep a weak reference back to
//! the connection. Releasing a resource after its connection has gone away is therefore
//! harmless and merely recorded as a [`Warning`].
//!
//! A [`Session`] bundles connection, channel and topology for one participant. On top of it
//! the [`request`] module implements the actual pattern: any number of
//! [`Correlator`](request::Correlator)s publish requests and compete for responses on a
//! shared queue while a single [`Responder`](request::Responder) serves the requests.

mod connection;
mod error;
mod session;
mod warning;

pub mod codec;
pub mod implementation;
pub mod protocol;
pub mod request;
pub mod topology;
pub mod transport;
pub mod validation;

pub use codec::{Codec, WireFormat};
pub use connection::{Channel, Connection};
pub use error::{CloseScope, Error};
pub use session::{Endpoint, Session, SessionConfig, COMPETING_PREFETCH};
pub use topology::{TeardownPolicy, TopologyLayout};
pub use transport::{Envelope, FrameSource, Transport};
pub use warning::{Warning, WarningLog};
