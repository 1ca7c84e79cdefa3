//! Sandboxed execution of user transformation code.
//!
//! Defense in depth across five layers, each independently required:
//! static analysis of the source ([`lang::analyze`]), compilation to a
//! restricted serializable program ([`lang`]), a guarded interpreter
//! with a curated symbol table ([`lang::interp`]), process isolation
//! in a freshly spawned runner with a cleared environment and a
//! private scratch directory ([`executor`]), and a resource monitor
//! enforcing wall-clock and memory caps ([`executor`] again). The
//! parent and the runner exchange one JSON envelope each way
//! ([`envelope`]).

pub mod envelope;
pub mod executor;
pub mod lang;
pub mod runner;

pub use executor::{
    ExecutionReport, SandboxErrorKind, SandboxExecutor, SandboxFailure, SandboxLimits,
    SandboxSuccess,
};
