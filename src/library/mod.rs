//! Independent and project agnostic libraries
//!
//! Nothing in here knows about the concrete messages exchanged by this crate; those live in
//! the [`domain`](super::domain) module. Any submodule could be extracted into its own crate.

pub mod communication;
pub mod helpers;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
