//! Domain specific structures, implementations, and logic

mod compute;

pub use compute::*;
