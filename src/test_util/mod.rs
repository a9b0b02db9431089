//! Utilities for testing code on top of sessions without a real network. They are used for
//!  testing this crate, but they are also exported for application testing.

pub mod simulated_network;
