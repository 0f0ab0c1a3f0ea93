//! Crash-resilient recording of the local capture.

pub mod recorder;
pub mod store;
