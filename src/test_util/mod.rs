//! Utilities for testing code built on groups. They are used for testing this crate itself, but
//!  they are also exported for application testing.
//!
//! Rust does not provide a way to share `#[cfg(test)]` code with a third party crate, so test
//!  utilities are part of the crate's regular code.

pub mod listener;
pub mod message;
pub mod network;
pub mod node;
