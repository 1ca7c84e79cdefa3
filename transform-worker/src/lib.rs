//! Worker internals: configuration, the per-job processor, and the
//! polling supervisor. The binary in `main.rs` wires these together.

pub mod config;
pub mod error;
pub mod processor;
pub mod supervisor;
