//! Shared plumbing for the transform platform: the durable job queue,
//! tabular storage against externally managed tables, the identifier
//! policy that keeps user-supplied names out of SQL text, and the
//! liveness/metrics endpoints the worker exposes.

pub mod datastore;
pub mod frame;
pub mod health;
pub mod ident;
pub mod metrics;
pub mod queue;
pub mod script;
