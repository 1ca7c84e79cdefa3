//! Static analysis and compilation of user source.
//!
//! This runs in the orchestrating process, before anything is sent to
//! a runner: a textual pre-scan for escape patterns, the wrap of bare
//! statement bodies into a `transform` definition, the parse itself,
//! and an AST walk for banned imports and calls. The first triggering
//! rule becomes the rejection message.

use super::ast::{Expr, Program, Stmt, Target};
use super::parser;

/// Modules user code may import. `pd`/`np` are accepted aliases.
pub const ALLOWED_MODULES: &[&str] = &["pandas", "pd", "numpy", "np", "datetime", "math"];

/// Call targets that are rejected wherever they appear.
pub const BANNED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "__import__",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
];

/// Textual patterns checked before parsing, mirroring the runtime
/// guards so rejection happens as early as possible. Matching is
/// case-insensitive on the whole source.
const TEXT_PATTERNS: &[(&str, &str)] = &[
    ("__import__", "Dynamic imports are not allowed"),
    ("importlib", "importlib is not allowed"),
    ("eval(", "eval() is not allowed"),
    ("exec(", "exec() is not allowed"),
    ("compile(", "compile() is not allowed"),
    ("open(", "File operations are not allowed"),
    ("globals(", "globals() is not allowed"),
    ("locals(", "locals() is not allowed"),
    ("vars(", "vars() is not allowed"),
    ("getattr(", "getattr() is not allowed - use direct attribute access"),
    ("setattr(", "setattr() is not allowed"),
    ("delattr(", "delattr() is not allowed"),
    ("__builtins__", "Access to __builtins__ is not allowed"),
    (".__class__", "Access to __class__ is not allowed"),
    (".__bases__", "Access to __bases__ is not allowed"),
    (".__subclasses__", "Access to __subclasses__ is not allowed"),
    (".__globals__", "Access to __globals__ is not allowed"),
    (".__code__", "Access to __code__ is not allowed"),
    (".__mro__", "Access to __mro__ is not allowed"),
    (".__dict__", "Access to __dict__ is not allowed"),
    ("async ", "Async constructs are not allowed"),
    ("await ", "Await expressions are not allowed"),
];

/// A source rejected by static analysis, before any execution.
#[derive(Debug, Clone)]
pub struct StaticRejection {
    pub message: String,
}

impl std::fmt::Display for StaticRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StaticRejection {}

/// Compile user source into a program artifact, or reject it.
pub fn compile(source: &str) -> Result<Program, StaticRejection> {
    pre_validate(source)?;

    let wrapped = wrap_transform_function(source);
    let program = parser::parse(&wrapped).map_err(|error| StaticRejection {
        message: format!("Syntax error at line {}: {}", error.line, error.message),
    })?;

    validate_ast(&program)?;
    Ok(program)
}

fn pre_validate(source: &str) -> Result<(), StaticRejection> {
    let lowered = source.to_lowercase();
    for (pattern, message) in TEXT_PATTERNS {
        if lowered.contains(&pattern.to_lowercase()) {
            return Err(StaticRejection {
                message: (*message).to_owned(),
            });
        }
    }
    Ok(())
}

/// Wrap bare statement bodies as `def transform(df):` the way users
/// write quick one-liners; sources that already define `transform`
/// pass through untouched.
fn wrap_transform_function(source: &str) -> String {
    if source.contains("def transform") {
        return source.to_owned();
    }

    let indented = source
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                line.to_owned()
            } else {
                format!("    {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("def transform(df):\n{indented}\n    return df\n")
}

fn validate_ast(program: &Program) -> Result<(), StaticRejection> {
    for stmt in &program.body {
        validate_stmt(stmt)?;
    }
    Ok(())
}

fn validate_stmt(stmt: &Stmt) -> Result<(), StaticRejection> {
    match stmt {
        Stmt::Import { module, .. } => validate_import(module),
        Stmt::FromImport { module, .. } => validate_import(module),
        Stmt::FunctionDef { body, .. } => {
            for inner in body {
                validate_stmt(inner)?;
            }
            Ok(())
        }
        Stmt::If {
            test, body, orelse, ..
        } => {
            validate_expr(test)?;
            for inner in body.iter().chain(orelse) {
                validate_stmt(inner)?;
            }
            Ok(())
        }
        Stmt::While { test, body, .. } => {
            validate_expr(test)?;
            for inner in body {
                validate_stmt(inner)?;
            }
            Ok(())
        }
        Stmt::For { iter, body, .. } => {
            validate_expr(iter)?;
            for inner in body {
                validate_stmt(inner)?;
            }
            Ok(())
        }
        Stmt::Assign { target, value, .. } => {
            validate_target(target)?;
            validate_expr(value)
        }
        Stmt::AugAssign { target, value, .. } => {
            validate_target(target)?;
            validate_expr(value)
        }
        Stmt::Return { value, .. } => value.as_ref().map_or(Ok(()), validate_expr),
        Stmt::Expr { value, .. } => validate_expr(value),
        Stmt::Pass { .. } | Stmt::Break { .. } | Stmt::Continue { .. } => Ok(()),
    }
}

fn validate_target(target: &Target) -> Result<(), StaticRejection> {
    match target {
        Target::Name(_) => Ok(()),
        Target::Subscript { value, index } => {
            validate_expr(value)?;
            validate_expr(index)
        }
    }
}

fn validate_expr(expr: &Expr) -> Result<(), StaticRejection> {
    match expr {
        Expr::Call { func, args, .. } => {
            if let Expr::Name(name) = func.as_ref() {
                if BANNED_CALLS.contains(&name.as_str()) {
                    return Err(StaticRejection {
                        message: format!("{name}() is not allowed"),
                    });
                }
            }
            validate_expr(func)?;
            for arg in args {
                validate_expr(arg)?;
            }
            Ok(())
        }
        Expr::Attribute { value, .. } => validate_expr(value),
        Expr::Subscript { value, index, .. } => {
            validate_expr(value)?;
            validate_expr(index)
        }
        Expr::Binary { left, right, .. } | Expr::Compare { left, right, .. } => {
            validate_expr(left)?;
            validate_expr(right)
        }
        Expr::BoolOp { values, .. } => {
            for value in values {
                validate_expr(value)?;
            }
            Ok(())
        }
        Expr::Not(inner) | Expr::Unary { operand: inner, .. } => validate_expr(inner),
        Expr::List(items) => {
            for item in items {
                validate_expr(item)?;
            }
            Ok(())
        }
        Expr::Dict(items) => {
            for (key, value) in items {
                validate_expr(key)?;
                validate_expr(value)?;
            }
            Ok(())
        }
        Expr::Int(_)
        | Expr::Float(_)
        | Expr::Str(_)
        | Expr::Bool(_)
        | Expr::NoneLit
        | Expr::Name(_) => Ok(()),
    }
}

fn validate_import(module: &str) -> Result<(), StaticRejection> {
    let base = module.split('.').next().unwrap_or(module);
    if ALLOWED_MODULES.contains(&base) {
        Ok(())
    } else {
        Err(StaticRejection {
            message: format!(
                "Import of '{module}' is not allowed. Only pandas, numpy, datetime, and math are permitted."
            ),
        })
    }
}
