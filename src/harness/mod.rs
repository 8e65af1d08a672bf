//! Lifecycle management for long running roles
//!
//! A [`Module`] is executed by the [`ModuleRunner`] which takes care of startup and shutdown
//! hooks. Its lifetime is bound to a [`Heart`] which can be stopped from the outside through the
//! linked [`HeartStone`]. Roles that repeatedly poll the broker do so inside a [`PollLoop`].

mod heart;
mod module;
mod poll_loop;

pub use heart::*;
pub use module::*;
pub use poll_loop::*;
