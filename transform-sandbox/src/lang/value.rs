//! Runtime values and the attribute guard.
//!
//! Frames, lists, and dicts share structure through `Rc<RefCell<_>>`
//! so `df["x"] = ...` mutates the caller's binding the way users
//! expect. The interpreter is single threaded inside the runner
//! process, so `Rc` is sufficient.

use std::cell::RefCell;
use std::rc::Rc;

use polars::prelude::*;

use super::ast::Stmt;

/// An error raised by guarded evaluation; the interpreter attaches
/// stack frames as it unwinds.
#[derive(Debug, Clone)]
pub struct Raised {
    pub error_type: String,
    pub message: String,
}

impl Raised {
    pub fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.to_owned(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{name}' is not defined"))
    }

    pub fn key_error(key: &str) -> Self {
        Self::new("KeyError", format!("'{key}'"))
    }
}

#[derive(Debug, Clone)]
pub struct UserFunction {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

/// Stateful iterator produced by `iter()` and advanced by `next()`.
#[derive(Debug)]
pub struct IterState {
    pub items: Vec<Value>,
    pub pos: usize,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    Series(Series),
    Frame(Rc<RefCell<DataFrame>>),
    Iter(Rc<RefCell<IterState>>),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    Function(Rc<UserFunction>),
    Builtin(String),
    Module(String),
    BoundMethod { target: Box<Value>, method: String },
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(items: Vec<(Value, Value)>) -> Self {
        Value::Dict(Rc::new(RefCell::new(items)))
    }

    pub fn frame(df: DataFrame) -> Self {
        Value::Frame(Rc::new(RefCell::new(df)))
    }

    pub fn iterator(items: Vec<Value>) -> Self {
        Value::Iter(Rc::new(RefCell::new(IterState { items, pos: 0 })))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Series(_) => "Series",
            Value::Frame(_) => "DataFrame",
            Value::Iter(_) => "iterator",
            Value::Slice { .. } => "slice",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Module(_) => "module",
            Value::BoundMethod { .. } => "method",
        }
    }

    pub fn is_truthy(&self) -> Result<bool, Raised> {
        match self {
            Value::None => Ok(false),
            Value::Bool(value) => Ok(*value),
            Value::Int(value) => Ok(*value != 0),
            Value::Float(value) => Ok(*value != 0.0),
            Value::Str(value) => Ok(!value.is_empty()),
            Value::List(items) => Ok(!items.borrow().is_empty()),
            Value::Dict(items) => Ok(!items.borrow().is_empty()),
            Value::Series(_) => Err(Raised::value_error(
                "The truth value of a Series is ambiguous. Use a comparison to build a mask.",
            )),
            Value::Frame(_) => Err(Raised::value_error(
                "The truth value of a DataFrame is ambiguous.",
            )),
            _ => Ok(true),
        }
    }

    /// Structural equality for scalar-ish values; reference equality
    /// for everything else.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Bool(a), Value::Int(b)) | (Value::Int(b), Value::Bool(a)) => {
                i64::from(*a) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Frame(a), Value::Frame(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Rendering used by `str()` and `print()`.
    pub fn render(&self) -> String {
        match self {
            Value::None => "None".to_owned(),
            Value::Bool(true) => "True".to_owned(),
            Value::Bool(false) => "False".to_owned(),
            Value::Int(value) => value.to_string(),
            Value::Float(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    format!("{value:.1}")
                } else {
                    value.to_string()
                }
            }
            Value::Str(value) => value.clone(),
            Value::List(items) => {
                let rendered = items
                    .borrow()
                    .iter()
                    .map(Value::repr)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{rendered}]")
            }
            Value::Dict(items) => {
                let rendered = items
                    .borrow()
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key.repr(), value.repr()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{rendered}}}")
            }
            Value::Series(series) => format!("{series:?}"),
            Value::Frame(df) => format!("{:?}", df.borrow()),
            Value::Iter(_) => "<iterator>".to_owned(),
            Value::Slice { start, stop, step } => {
                let bound = |bound: &Option<i64>| match bound {
                    Some(value) => value.to_string(),
                    None => "None".to_owned(),
                };
                format!("slice({}, {}, {})", bound(start), bound(stop), bound(step))
            }
            Value::Function(function) => format!("<function {}>", function.name),
            Value::Builtin(name) => format!("<built-in function {name}>"),
            Value::Module(name) => format!("<module '{name}'>"),
            Value::BoundMethod { method, .. } => format!("<bound method {method}>"),
        }
    }

    /// Rendering used by `repr()`: like [`Value::render`], but strings
    /// keep their quotes.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(value) => format!("'{value}'"),
            other => other.render(),
        }
    }
}

/// Attributes blocked on every object, irrespective of prefix.
pub const BLOCKED_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__bases__",
    "__subclasses__",
    "__mro__",
    "__globals__",
    "__code__",
    "__closure__",
    "__func__",
    "__self__",
    "__dict__",
    "__slots__",
    "__module__",
    "__delattr__",
    "__setattr__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
    "__getstate__",
    "__setstate__",
    "__enter__",
    "__exit__",
    "__await__",
    "__aenter__",
    "__aexit__",
    "__aiter__",
    "__anext__",
];

/// Value and arithmetic dunders exempt from the leading-underscore
/// rule.
pub const SAFE_DUNDERS: &[&str] = &[
    "__len__",
    "__iter__",
    "__getitem__",
    "__contains__",
    "__str__",
    "__repr__",
    "__bool__",
    "__eq__",
    "__ne__",
    "__lt__",
    "__le__",
    "__gt__",
    "__ge__",
    "__hash__",
    "__add__",
    "__sub__",
    "__mul__",
    "__truediv__",
    "__floordiv__",
    "__mod__",
    "__pow__",
    "__neg__",
    "__pos__",
    "__abs__",
];

/// Frame and column methods that would reach the filesystem, the
/// network, or the database. Data output is handled by the system.
pub const BLOCKED_IO_METHODS: &[&str] = &[
    "to_pickle",
    "to_parquet",
    "to_sql",
    "to_excel",
    "to_csv",
    "to_json",
    "to_html",
    "to_latex",
    "to_feather",
    "to_stata",
    "to_gbq",
    "to_hdf",
    "to_clipboard",
    "to_markdown",
    "to_xml",
    "read_pickle",
    "read_parquet",
    "read_sql",
    "read_excel",
    "read_csv",
    "read_json",
    "read_html",
    "read_feather",
    "read_stata",
    "read_hdf",
    "read_clipboard",
    "read_xml",
];

/// The attribute guard. Every attribute access funnels through here
/// before any lookup happens.
pub fn check_attribute_allowed(value: &Value, name: &str) -> Result<(), Raised> {
    if BLOCKED_ATTRIBUTES.contains(&name) {
        return Err(Raised::attribute_error(format!(
            "Access to '{name}' is not allowed for security reasons"
        )));
    }

    if name.starts_with("__") && name.ends_with("__") {
        if !SAFE_DUNDERS.contains(&name) {
            return Err(Raised::attribute_error(format!(
                "Access to '{name}' is not allowed for security reasons"
            )));
        }
    } else if name.starts_with('_') {
        return Err(Raised::attribute_error(format!(
            "Access to private attribute '{name}' is not allowed"
        )));
    }

    if matches!(value, Value::Frame(_) | Value::Series(_)) && BLOCKED_IO_METHODS.contains(&name) {
        return Err(Raised::attribute_error(format!(
            "DataFrame.{name}() is not allowed - data output is handled by the system"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_blocks_dunders_outside_allow_list() {
        let value = Value::Int(1);
        assert!(check_attribute_allowed(&value, "__class__").is_err());
        assert!(check_attribute_allowed(&value, "__getattribute__").is_err());
        assert!(check_attribute_allowed(&value, "__init__").is_err());
    }

    #[test]
    fn test_guard_allows_value_dunders() {
        let value = Value::Int(1);
        assert!(check_attribute_allowed(&value, "__len__").is_ok());
        assert!(check_attribute_allowed(&value, "__add__").is_ok());
    }

    #[test]
    fn test_guard_blocks_private_attributes() {
        let value = Value::Int(1);
        assert!(check_attribute_allowed(&value, "_private").is_err());
    }

    #[test]
    fn test_guard_blocks_frame_io_methods() {
        let frame = Value::frame(DataFrame::empty());
        let error = check_attribute_allowed(&frame, "to_csv").unwrap_err();
        assert!(error.message.contains("not allowed"));
        assert!(check_attribute_allowed(&frame, "to_sql").is_err());
        assert!(check_attribute_allowed(&frame, "read_csv").is_err());
        // but io names on non-frame values are ordinary attributes
        assert!(check_attribute_allowed(&Value::Int(1), "to_csv").is_ok());
    }

    #[test]
    fn test_truthiness_of_series_is_an_error() {
        let series = Value::Series(Series::new("x".into(), &[1i64, 2]));
        assert!(series.is_truthy().is_err());
    }

    #[test]
    fn test_loose_eq_promotes_ints_to_floats() {
        assert!(Value::Int(2).loose_eq(&Value::Float(2.0)));
        assert!(!Value::Int(2).loose_eq(&Value::Float(2.5)));
    }

    #[test]
    fn test_render_python_style() {
        assert_eq!(Value::Bool(true).render(), "True");
        assert_eq!(Value::None.render(), "None");
        assert_eq!(Value::Float(3.0).render(), "3.0");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Str("a".into())]).render(),
            "[1, 'a']"
        );
    }
}
