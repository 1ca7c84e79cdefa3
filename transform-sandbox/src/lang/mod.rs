//! The restricted transform dialect.
//!
//! A small Python-like language: `def transform(df):` definitions (or
//! bare statement bodies that get wrapped into one), assignments,
//! `if`/`while`/`for`, imports from an allow-list, and expressions
//! over scalars, lists, dicts, columns, and frames. The front-end
//! compiles source text to a serializable [`ast::Program`]; the
//! guarded [`interp::Interpreter`] evaluates it inside the runner
//! process.

pub mod analyze;
pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod value;

pub use analyze::{compile, StaticRejection};
