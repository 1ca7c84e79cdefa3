//! Guarded tree-walking evaluator for compiled transform programs.
//!
//! Runs inside the runner process. Name resolution only ever reaches
//! the curated builtin set and the pre-imported module bindings the
//! parent shipped in the envelope; attribute access, subscripts,
//! iteration, unpacking, and imports all pass through guards. Infinite
//! loops and memory growth are not bounded here: the parent's resource
//! monitor owns those limits.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use polars::prelude::*;

use super::ast::*;
use super::value::{check_attribute_allowed, Raised, UserFunction, Value};

/// Builtins exposed to user code.
pub const SAFE_BUILTINS: &[&str] = &[
    "len",
    "range",
    "enumerate",
    "zip",
    "map",
    "filter",
    "sorted",
    "reversed",
    "min",
    "max",
    "sum",
    "abs",
    "round",
    "pow",
    "divmod",
    "all",
    "any",
    "list",
    "dict",
    "set",
    "frozenset",
    "tuple",
    "str",
    "int",
    "float",
    "bool",
    "complex",
    "chr",
    "ord",
    "ascii",
    "repr",
    "format",
    "iter",
    "next",
    "slice",
    "print",
    "type",
    "isinstance",
    "issubclass",
    "callable",
    "id",
    "hash",
];

/// Module bindings installed into the global scope before execution.
pub const PRELOADED_MODULES: &[&str] = &["pd", "pandas", "np", "numpy", "datetime", "math"];

const MAX_CALL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub function: String,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct EvalError {
    pub error_type: String,
    pub message: String,
    pub frames: Vec<FrameInfo>,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

type ExecResult = Result<Flow, EvalError>;
type EvalResult = Result<Value, EvalError>;

pub struct Interpreter {
    globals: HashMap<String, Value>,
    scopes: Vec<HashMap<String, Value>>,
    builtins: Vec<String>,
    printed: String,
    current_line: usize,
    function_stack: Vec<String>,
}

impl Interpreter {
    /// Build an interpreter whose global scope holds exactly the
    /// symbols named in the shipped restricted symbol table.
    pub fn with_symbols(modules: &[String], builtins: &[String]) -> Self {
        let mut globals = HashMap::new();
        for module in modules {
            if PRELOADED_MODULES.contains(&module.as_str()) {
                globals.insert(module.clone(), Value::Module(canonical_module(module)));
            }
        }

        Self {
            globals,
            scopes: Vec::new(),
            builtins: builtins
                .iter()
                .filter(|name| SAFE_BUILTINS.contains(&name.as_str()))
                .cloned()
                .collect(),
            printed: String::new(),
            current_line: 0,
            function_stack: Vec::new(),
        }
    }

    pub fn with_default_symbols() -> Self {
        Self::with_symbols(
            &PRELOADED_MODULES
                .iter()
                .map(|name| (*name).to_owned())
                .collect::<Vec<_>>(),
            &SAFE_BUILTINS
                .iter()
                .map(|name| (*name).to_owned())
                .collect::<Vec<_>>(),
        )
    }

    /// Execute top-level statements, populating the global scope.
    pub fn run_program(&mut self, program: &Program) -> Result<(), EvalError> {
        for stmt in &program.body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                Flow::Return(_) => {
                    return Err(self.err(Raised::new("SyntaxError", "'return' outside function")))
                }
                Flow::Break | Flow::Continue => {
                    return Err(self.err(Raised::new("SyntaxError", "loop control outside loop")))
                }
            }
        }
        Ok(())
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Text printed by user code via `print()`.
    pub fn printed(&self) -> &str {
        &self.printed
    }

    /// Call a value as a function with positional arguments.
    pub fn call(&mut self, func: &Value, args: Vec<Value>) -> EvalResult {
        let line = self.current_line;
        self.call_value(func, args, line)
    }

    // Statements

    fn exec_stmt(&mut self, stmt: &Stmt) -> ExecResult {
        self.current_line = stmt.line();
        match stmt {
            Stmt::FunctionDef {
                name, params, body, ..
            } => {
                let function = Value::Function(Rc::new(UserFunction {
                    name: name.clone(),
                    params: params.clone(),
                    body: body.clone(),
                }));
                self.assign_name(name, function);
                Ok(Flow::Normal)
            }
            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Assign { target, value, .. } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
                Ok(Flow::Normal)
            }
            Stmt::AugAssign {
                target, op, value, ..
            } => {
                let rhs = self.eval(value)?;
                match target {
                    Target::Name(name) => {
                        let current = self.lookup(name)?;
                        let updated = self.binop(*op, current, rhs)?;
                        self.assign_name(name, updated);
                    }
                    Target::Subscript { value, index } => {
                        let base = self.eval(value)?;
                        let key = self.eval(index)?;
                        let current = self.get_subscript(&base, &key)?;
                        let updated = self.binop(*op, current, rhs)?;
                        self.set_subscript(&base, &key, updated)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::If {
                test, body, orelse, ..
            } => {
                let test = self.eval(test)?;
                let truthy = test.is_truthy().map_err(|raised| self.err(raised))?;
                let branch = if truthy { body } else { orelse };
                self.exec_block(branch)
            }
            Stmt::While { test, body, .. } => {
                loop {
                    let value = self.eval(test)?;
                    if !value.is_truthy().map_err(|raised| self.err(raised))? {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                targets,
                iter,
                body,
                ..
            } => {
                let iterable = self.eval(iter)?;
                let items = self
                    .iter_values(&iterable)
                    .map_err(|raised| self.err(raised))?;
                for item in items {
                    self.bind_loop_targets(targets, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Import { module, alias, .. } => {
                let bound = self
                    .import_module(module)
                    .map_err(|raised| self.err(raised))?;
                let name = alias.clone().unwrap_or_else(|| {
                    module.split('.').next().unwrap_or(module).to_owned()
                });
                self.assign_name(&name, bound);
                Ok(Flow::Normal)
            }
            Stmt::FromImport { module, names, .. } => {
                let bound = self
                    .import_module(module)
                    .map_err(|raised| self.err(raised))?;
                let Value::Module(canonical) = &bound else {
                    return Err(self.err(Raised::new("ImportError", "not a module")));
                };
                for name in names {
                    let attr = self
                        .module_attr(canonical, name)
                        .map_err(|raised| self.err(raised))?;
                    self.assign_name(name, attr);
                }
                Ok(Flow::Normal)
            }
            Stmt::Expr { value, .. } => {
                self.eval(value)?;
                Ok(Flow::Normal)
            }
            Stmt::Pass { .. } => Ok(Flow::Normal),
            Stmt::Break { .. } => Ok(Flow::Break),
            Stmt::Continue { .. } => Ok(Flow::Continue),
        }
    }

    fn exec_block(&mut self, body: &[Stmt]) -> ExecResult {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn bind_loop_targets(&mut self, targets: &[String], item: Value) -> Result<(), EvalError> {
        if targets.len() == 1 {
            self.assign_name(&targets[0], item);
            return Ok(());
        }

        // sequence unpack goes through the guard: only lists unpack
        let Value::List(items) = &item else {
            return Err(self.err(Raised::type_error(format!(
                "cannot unpack non-sequence {}",
                item.type_name()
            ))));
        };
        let items = items.borrow().clone();
        if items.len() != targets.len() {
            return Err(self.err(Raised::value_error(format!(
                "expected {} values to unpack, got {}",
                targets.len(),
                items.len()
            ))));
        }
        for (target, value) in targets.iter().zip(items) {
            self.assign_name(target, value);
        }
        Ok(())
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), EvalError> {
        match target {
            Target::Name(name) => {
                self.assign_name(name, value);
                Ok(())
            }
            Target::Subscript {
                value: base_expr,
                index,
            } => {
                let base = self.eval(base_expr)?;
                let key = self.eval(index)?;
                self.set_subscript(&base, &key, value)
            }
        }
    }

    fn assign_name(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_owned(), value);
        } else {
            self.globals.insert(name.to_owned(), value);
        }
    }

    fn lookup(&mut self, name: &str) -> EvalResult {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if self.builtins.iter().any(|builtin| builtin == name) {
            return Ok(Value::Builtin(name.to_owned()));
        }
        Err(self.err(Raised::name_error(name)))
    }

    // Expressions

    fn eval(&mut self, expr: &Expr) -> EvalResult {
        match expr {
            Expr::Int(value) => Ok(Value::Int(*value)),
            Expr::Float(value) => Ok(Value::Float(*value)),
            Expr::Str(value) => Ok(Value::Str(value.clone())),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::NoneLit => Ok(Value::None),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::list(values))
            }
            Expr::Dict(items) => {
                let mut values = Vec::with_capacity(items.len());
                for (key, value) in items {
                    values.push((self.eval(key)?, self.eval(value)?));
                }
                Ok(Value::dict(values))
            }
            Expr::Attribute { value, attr, line } => {
                self.current_line = *line;
                let target = self.eval(value)?;
                self.eval_attribute(target, attr)
            }
            Expr::Subscript { value, index, line } => {
                self.current_line = *line;
                let base = self.eval(value)?;
                let key = self.eval(index)?;
                self.get_subscript(&base, &key)
            }
            Expr::Call { func, args, line } => {
                let func_value = self.eval(func)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg)?);
                }
                self.current_line = *line;
                self.call_value(&func_value, arg_values, *line)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                self.unary(*op, value)
            }
            Expr::Binary {
                op,
                left,
                right,
                line,
            } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.current_line = *line;
                self.binop(*op, left, right)
            }
            Expr::Compare {
                op,
                left,
                right,
                line,
            } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.current_line = *line;
                self.compare(*op, left, right)
            }
            Expr::BoolOp { op, values } => {
                let mut last = Value::None;
                for (index, value) in values.iter().enumerate() {
                    last = self.eval(value)?;
                    if index + 1 == values.len() {
                        break;
                    }
                    let truthy = last.is_truthy().map_err(|raised| self.err(raised))?;
                    match op {
                        BoolOpKind::And if !truthy => break,
                        BoolOpKind::Or if truthy => break,
                        _ => {}
                    }
                }
                Ok(last)
            }
            Expr::Not(inner) => {
                let value = self.eval(inner)?;
                let truthy = value.is_truthy().map_err(|raised| self.err(raised))?;
                Ok(Value::Bool(!truthy))
            }
        }
    }

    fn call_value(&mut self, func: &Value, args: Vec<Value>, call_line: usize) -> EvalResult {
        if self.function_stack.len() >= MAX_CALL_DEPTH {
            return Err(self.err(Raised::new(
                "RecursionError",
                "maximum recursion depth exceeded",
            )));
        }

        match func {
            Value::Function(function) => {
                if args.len() != function.params.len() {
                    return Err(self.err(Raised::type_error(format!(
                        "{}() takes {} argument(s) but {} were given",
                        function.name,
                        function.params.len(),
                        args.len()
                    ))));
                }

                let mut scope = HashMap::new();
                for (param, value) in function.params.iter().zip(args) {
                    scope.insert(param.clone(), value);
                }
                self.scopes.push(scope);
                self.function_stack.push(function.name.clone());

                let result = self.exec_block(&function.body);

                self.scopes.pop();
                self.function_stack.pop();

                match result {
                    Ok(Flow::Return(value)) => Ok(value),
                    Ok(_) => Ok(Value::None),
                    Err(mut error) => {
                        error.frames.push(FrameInfo {
                            function: self.current_function(),
                            line: call_line,
                        });
                        Err(error)
                    }
                }
            }
            Value::Builtin(name) => self
                .call_builtin(name.clone(), args)
                .map_err(|raised| self.err(raised)),
            Value::BoundMethod { target, method } => {
                let target = (**target).clone();
                self.call_method(&target, method.clone(), args)
                    .map_err(|raised| self.err(raised))
            }
            other => Err(self.err(Raised::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            )))),
        }
    }

    // Attribute access

    fn eval_attribute(&mut self, value: Value, attr: &str) -> EvalResult {
        check_attribute_allowed(&value, attr).map_err(|raised| self.err(raised))?;

        let result = match &value {
            Value::Module(name) => self.module_attr(name, attr),
            Value::Frame(df) => match attr {
                "columns" => Ok(Value::list(
                    df.borrow()
                        .get_column_names()
                        .into_iter()
                        .map(|name| Value::Str(name.to_string()))
                        .collect(),
                )),
                "shape" => {
                    let df = df.borrow();
                    Ok(Value::list(vec![
                        Value::Int(df.height() as i64),
                        Value::Int(df.width() as i64),
                    ]))
                }
                "empty" => Ok(Value::Bool(df.borrow().height() == 0)),
                "head" | "tail" | "copy" | "drop" => Ok(Value::BoundMethod {
                    target: Box::new(value.clone()),
                    method: attr.to_owned(),
                }),
                _ => Err(Raised::attribute_error(format!(
                    "'DataFrame' object has no attribute '{attr}'"
                ))),
            },
            Value::Series(_) => match attr {
                "sum" | "mean" | "min" | "max" | "abs" | "fillna" | "astype" => {
                    Ok(Value::BoundMethod {
                        target: Box::new(value.clone()),
                        method: attr.to_owned(),
                    })
                }
                _ => Err(Raised::attribute_error(format!(
                    "'Series' object has no attribute '{attr}'"
                ))),
            },
            Value::Str(_) => match attr {
                "upper" | "lower" | "strip" | "split" | "replace" | "startswith" | "endswith" => {
                    Ok(Value::BoundMethod {
                        target: Box::new(value.clone()),
                        method: attr.to_owned(),
                    })
                }
                _ => Err(Raised::attribute_error(format!(
                    "'str' object has no attribute '{attr}'"
                ))),
            },
            Value::List(_) => match attr {
                "append" => Ok(Value::BoundMethod {
                    target: Box::new(value.clone()),
                    method: attr.to_owned(),
                }),
                _ => Err(Raised::attribute_error(format!(
                    "'list' object has no attribute '{attr}'"
                ))),
            },
            Value::Dict(_) => match attr {
                "keys" | "values" | "items" | "get" => Ok(Value::BoundMethod {
                    target: Box::new(value.clone()),
                    method: attr.to_owned(),
                }),
                _ => Err(Raised::attribute_error(format!(
                    "'dict' object has no attribute '{attr}'"
                ))),
            },
            other => Err(Raised::attribute_error(format!(
                "'{}' object has no attribute '{attr}'",
                other.type_name()
            ))),
        };

        result.map_err(|raised| self.err(raised))
    }

    fn module_attr(&self, module: &str, attr: &str) -> Result<Value, Raised> {
        match module {
            "math" => match attr {
                "pi" => Ok(Value::Float(std::f64::consts::PI)),
                "e" => Ok(Value::Float(std::f64::consts::E)),
                "sqrt" | "floor" | "ceil" | "exp" | "log" | "log10" | "fabs" | "pow" => {
                    Ok(Value::Builtin(format!("math.{attr}")))
                }
                _ => Err(Raised::attribute_error(format!(
                    "module 'math' has no attribute '{attr}'"
                ))),
            },
            "numpy" => match attr {
                "nan" => Ok(Value::Float(f64::NAN)),
                "where" | "abs" | "sqrt" | "log" | "exp" => {
                    Ok(Value::Builtin(format!("np.{attr}")))
                }
                _ => Err(Raised::attribute_error(format!(
                    "module 'numpy' has no attribute '{attr}'"
                ))),
            },
            "pandas" => match attr {
                "isna" | "notna" => Ok(Value::Builtin(format!("pd.{attr}"))),
                _ => Err(Raised::attribute_error(format!(
                    "module 'pandas' has no attribute '{attr}'"
                ))),
            },
            "datetime" => Err(Raised::attribute_error(format!(
                "module 'datetime' attribute '{attr}' is not supported in the sandbox"
            ))),
            _ => Err(Raised::attribute_error(format!(
                "module '{module}' has no attribute '{attr}'"
            ))),
        }
    }

    fn import_module(&self, module: &str) -> Result<Value, Raised> {
        let base = module.split('.').next().unwrap_or(module);
        if PRELOADED_MODULES.contains(&base) {
            Ok(Value::Module(canonical_module(base)))
        } else {
            Err(Raised::new(
                "ImportError",
                format!(
                    "Import of '{module}' is not allowed. Allowed modules: datetime, math, numpy, pandas"
                ),
            ))
        }
    }

    // Subscripts

    fn get_subscript(&mut self, base: &Value, key: &Value) -> EvalResult {
        let result = self.get_subscript_inner(base, key);
        result.map_err(|raised| self.err(raised))
    }

    fn get_subscript_inner(&mut self, base: &Value, key: &Value) -> Result<Value, Raised> {
        match (base, key) {
            (Value::Frame(df), Value::Str(name)) => {
                let df = df.borrow();
                let column = df
                    .column(name.as_str())
                    .map_err(|_| Raised::key_error(name))?;
                Ok(Value::Series(column.as_materialized_series().clone()))
            }
            (Value::Frame(df), Value::Series(mask)) => {
                let mask = mask
                    .bool()
                    .map_err(|_| Raised::type_error("frame masks must be boolean"))?;
                let filtered = df
                    .borrow()
                    .filter(mask)
                    .map_err(|error| Raised::value_error(error.to_string()))?;
                Ok(Value::frame(filtered))
            }
            (Value::Frame(df), Value::List(names)) => {
                let names = names
                    .borrow()
                    .iter()
                    .map(|value| match value {
                        Value::Str(name) => Ok(name.clone()),
                        other => Err(Raised::type_error(format!(
                            "column selections must be strings, got {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<Result<Vec<_>, Raised>>()?;
                let selected = df
                    .borrow()
                    .select(names)
                    .map_err(|error| Raised::key_error(&error.to_string()))?;
                Ok(Value::frame(selected))
            }
            (Value::Series(series), Value::Int(index)) => {
                let index = normalize_index(*index, series.len())?;
                let any = series
                    .get(index)
                    .map_err(|_| Raised::new("IndexError", "series index out of range"))?;
                Ok(anyvalue_to_value(any))
            }
            (Value::List(items), Value::Int(index)) => {
                let items = items.borrow();
                let index = normalize_index(*index, items.len())?;
                Ok(items[index].clone())
            }
            (Value::Str(text), Value::Int(index)) => {
                let chars: Vec<char> = text.chars().collect();
                let index = normalize_index(*index, chars.len())?;
                Ok(Value::Str(chars[index].to_string()))
            }
            (Value::List(items), Value::Slice { start, stop, step }) => {
                let items = items.borrow();
                let (from, to) = resolve_slice(*start, *stop, *step, items.len())?;
                Ok(Value::list(items[from..to].to_vec()))
            }
            (Value::Str(text), Value::Slice { start, stop, step }) => {
                let chars: Vec<char> = text.chars().collect();
                let (from, to) = resolve_slice(*start, *stop, *step, chars.len())?;
                Ok(Value::Str(chars[from..to].iter().collect()))
            }
            (Value::Series(series), Value::Slice { start, stop, step }) => {
                let (from, to) = resolve_slice(*start, *stop, *step, series.len())?;
                Ok(Value::Series(series.slice(from as i64, to - from)))
            }
            (Value::Frame(df), Value::Slice { start, stop, step }) => {
                let df = df.borrow();
                let (from, to) = resolve_slice(*start, *stop, *step, df.height())?;
                Ok(Value::frame(df.slice(from as i64, to - from)))
            }
            (Value::Dict(items), key) => items
                .borrow()
                .iter()
                .find(|(candidate, _)| candidate.loose_eq(key))
                .map(|(_, value)| value.clone())
                .ok_or_else(|| Raised::key_error(&key.render())),
            (base, key) => Err(Raised::type_error(format!(
                "'{}' indices must be valid for '{}'",
                key.type_name(),
                base.type_name()
            ))),
        }
    }

    fn set_subscript(&mut self, base: &Value, key: &Value, value: Value) -> Result<(), EvalError> {
        self.set_subscript_inner(base, key, value)
            .map_err(|raised| self.err(raised))
    }

    fn set_subscript_inner(
        &mut self,
        base: &Value,
        key: &Value,
        value: Value,
    ) -> Result<(), Raised> {
        match (base, key) {
            (Value::Frame(df), Value::Str(name)) => {
                let height = df.borrow().height();
                let mut series = self.value_to_column(value, height, name)?;
                series.rename(name.as_str().into());
                df.borrow_mut()
                    .with_column(series)
                    .map_err(|error| Raised::value_error(error.to_string()))?;
                Ok(())
            }
            (Value::List(items), Value::Int(index)) => {
                let mut items = items.borrow_mut();
                let index = normalize_index(*index, items.len())?;
                items[index] = value;
                Ok(())
            }
            (Value::Dict(items), key) => {
                let mut items = items.borrow_mut();
                if let Some(entry) = items
                    .iter_mut()
                    .find(|(candidate, _)| candidate.loose_eq(key))
                {
                    entry.1 = value;
                } else {
                    items.push((key.clone(), value));
                }
                Ok(())
            }
            (base, _) => Err(Raised::type_error(format!(
                "'{}' object does not support item assignment",
                base.type_name()
            ))),
        }
    }

    /// Turn an assigned value into a column of the target frame's
    /// height, broadcasting scalars.
    fn value_to_column(
        &mut self,
        value: Value,
        height: usize,
        name: &str,
    ) -> Result<Series, Raised> {
        match value {
            Value::Series(series) => {
                if series.len() != height {
                    return Err(Raised::value_error(format!(
                        "cannot assign a column of length {} to a frame of height {height}",
                        series.len()
                    )));
                }
                Ok(series)
            }
            Value::Int(scalar) => Ok(Series::new(
                name.into(),
                vec![Some(scalar); height],
            )),
            Value::Float(scalar) => Ok(Series::new(
                name.into(),
                vec![Some(scalar); height],
            )),
            Value::Bool(scalar) => Ok(Series::new(
                name.into(),
                vec![Some(scalar); height],
            )),
            Value::Str(ref scalar) => Ok(Series::new(
                name.into(),
                vec![Some(scalar.clone()); height],
            )),
            Value::None => Ok(Series::new(
                name.into(),
                vec![None::<f64>; height],
            )),
            Value::List(items) => {
                let items = items.borrow();
                if items.len() != height {
                    return Err(Raised::value_error(format!(
                        "cannot assign a list of length {} to a frame of height {height}",
                        items.len()
                    )));
                }
                list_to_series(&items, name)
            }
            other => Err(Raised::type_error(format!(
                "cannot assign a {} as a column",
                other.type_name()
            ))),
        }
    }

    // Operators

    fn unary(&mut self, op: UnaryOp, value: Value) -> EvalResult {
        if op == UnaryOp::Neg && matches!(value, Value::Series(_)) {
            return self.binop(BinOp::Sub, Value::Int(0), value);
        }

        let result = match (op, &value) {
            (UnaryOp::Pos, Value::Int(_) | Value::Float(_) | Value::Bool(_)) => Ok(value.clone()),
            (UnaryOp::Neg, Value::Int(scalar)) => Ok(Value::Int(-scalar)),
            (UnaryOp::Neg, Value::Float(scalar)) => Ok(Value::Float(-scalar)),
            (UnaryOp::Neg, Value::Bool(scalar)) => Ok(Value::Int(-i64::from(*scalar))),
            (op, other) => Err(Raised::type_error(format!(
                "bad operand type for unary {}: '{}'",
                match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Pos => "+",
                },
                other.type_name()
            ))),
        };
        result.map_err(|raised| self.err(raised))
    }

    fn binop(&mut self, op: BinOp, left: Value, right: Value) -> EvalResult {
        binary_op(op, left, right).map_err(|raised| self.err(raised))
    }

    fn compare(&mut self, op: CmpOp, left: Value, right: Value) -> EvalResult {
        compare_op(op, left, right).map_err(|raised| self.err(raised))
    }

    // Iteration guard

    fn iter_values(&mut self, value: &Value) -> Result<Vec<Value>, Raised> {
        match value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Str(text) => Ok(text
                .chars()
                .map(|c| Value::Str(c.to_string()))
                .collect()),
            Value::Dict(items) => Ok(items
                .borrow()
                .iter()
                .map(|(key, _)| key.clone())
                .collect()),
            // iterating an iterator consumes it
            Value::Iter(state) => {
                let mut state = state.borrow_mut();
                let remaining = state.items[state.pos..].to_vec();
                state.pos = state.items.len();
                Ok(remaining)
            }
            Value::Series(series) => (0..series.len())
                .map(|index| {
                    series
                        .get(index)
                        .map(anyvalue_to_value)
                        .map_err(|_| Raised::new("IndexError", "series index out of range"))
                })
                .collect(),
            // iterating a frame yields its column names
            Value::Frame(df) => Ok(df
                .borrow()
                .get_column_names()
                .into_iter()
                .map(|name| Value::Str(name.to_string()))
                .collect()),
            other => Err(Raised::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    // Builtins

    fn call_builtin(&mut self, name: String, args: Vec<Value>) -> Result<Value, Raised> {
        match name.as_str() {
            "len" => {
                let [value] = take_args::<1>(&name, args)?;
                let length = match &value {
                    Value::Str(text) => text.chars().count(),
                    Value::List(items) => items.borrow().len(),
                    Value::Dict(items) => items.borrow().len(),
                    Value::Series(series) => series.len(),
                    Value::Frame(df) => df.borrow().height(),
                    other => {
                        return Err(Raised::type_error(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Int(length as i64))
            }
            "range" => {
                let (start, stop, step) = match args.len() {
                    1 => (0, expect_int(&args[0])?, 1),
                    2 => (expect_int(&args[0])?, expect_int(&args[1])?, 1),
                    3 => (
                        expect_int(&args[0])?,
                        expect_int(&args[1])?,
                        expect_int(&args[2])?,
                    ),
                    n => {
                        return Err(Raised::type_error(format!(
                            "range expected 1 to 3 arguments, got {n}"
                        )))
                    }
                };
                if step == 0 {
                    return Err(Raised::value_error("range() arg 3 must not be zero"));
                }
                let mut values = Vec::new();
                let mut current = start;
                while (step > 0 && current < stop) || (step < 0 && current > stop) {
                    values.push(Value::Int(current));
                    current += step;
                }
                Ok(Value::list(values))
            }
            "enumerate" => {
                let [value] = take_args::<1>(&name, args)?;
                let items = self.iter_values(&value)?;
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(index, item)| Value::list(vec![Value::Int(index as i64), item]))
                        .collect(),
                ))
            }
            "zip" => {
                let mut columns = Vec::with_capacity(args.len());
                for arg in &args {
                    columns.push(self.iter_values(arg)?);
                }
                let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
                Ok(Value::list(
                    (0..shortest)
                        .map(|index| {
                            Value::list(
                                columns.iter().map(|column| column[index].clone()).collect(),
                            )
                        })
                        .collect(),
                ))
            }
            "map" => {
                let [func, iterable] = take_args::<2>(&name, args)?;
                let items = self.iter_values(&iterable)?;
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    mapped.push(
                        self.call(&func, vec![item])
                            .map_err(|error| Raised::new(&error.error_type, error.message))?,
                    );
                }
                Ok(Value::list(mapped))
            }
            "filter" => {
                let [func, iterable] = take_args::<2>(&name, args)?;
                let items = self.iter_values(&iterable)?;
                let mut kept = Vec::new();
                for item in items {
                    let verdict = self
                        .call(&func, vec![item.clone()])
                        .map_err(|error| Raised::new(&error.error_type, error.message))?;
                    if verdict.is_truthy()? {
                        kept.push(item);
                    }
                }
                Ok(Value::list(kept))
            }
            "sorted" => {
                let [value] = take_args::<1>(&name, args)?;
                let mut items = self.iter_values(&value)?;
                let mut failure = None;
                items.sort_by(|a, b| match scalar_cmp(a, b) {
                    Ok(ordering) => ordering,
                    Err(raised) => {
                        failure.get_or_insert(raised);
                        Ordering::Equal
                    }
                });
                match failure {
                    Some(raised) => Err(raised),
                    None => Ok(Value::list(items)),
                }
            }
            "reversed" => {
                let [value] = take_args::<1>(&name, args)?;
                let mut items = self.iter_values(&value)?;
                items.reverse();
                Ok(Value::list(items))
            }
            "min" | "max" => {
                let items = if args.len() == 1 {
                    self.iter_values(&args[0])?
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(Raised::value_error(format!("{name}() arg is empty")));
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let ordering = scalar_cmp(item, &best)?;
                    let replace = if name == "min" {
                        ordering == Ordering::Less
                    } else {
                        ordering == Ordering::Greater
                    };
                    if replace {
                        best = item.clone();
                    }
                }
                Ok(best)
            }
            "sum" => {
                let [value] = take_args::<1>(&name, args)?;
                let items = self.iter_values(&value)?;
                let mut int_total = 0i64;
                let mut float_total = 0f64;
                let mut saw_float = false;
                for item in items {
                    match item {
                        Value::Int(scalar) => int_total += scalar,
                        Value::Bool(scalar) => int_total += i64::from(scalar),
                        Value::Float(scalar) => {
                            saw_float = true;
                            float_total += scalar;
                        }
                        other => {
                            return Err(Raised::type_error(format!(
                                "unsupported operand type for sum: '{}'",
                                other.type_name()
                            )))
                        }
                    }
                }
                if saw_float {
                    Ok(Value::Float(float_total + int_total as f64))
                } else {
                    Ok(Value::Int(int_total))
                }
            }
            "abs" => {
                let [value] = take_args::<1>(&name, args)?;
                match &value {
                    Value::Int(scalar) => Ok(Value::Int(scalar.abs())),
                    Value::Float(scalar) => Ok(Value::Float(scalar.abs())),
                    Value::Series(_) => series_abs(value.clone()),
                    other => Err(Raised::type_error(format!(
                        "bad operand type for abs(): '{}'",
                        other.type_name()
                    ))),
                }
            }
            "round" => {
                let digits = match args.len() {
                    1 => 0,
                    2 => expect_int(&args[1])?,
                    n => {
                        return Err(Raised::type_error(format!(
                            "round expected 1 or 2 arguments, got {n}"
                        )))
                    }
                };
                match &args[0] {
                    Value::Int(scalar) => Ok(Value::Int(*scalar)),
                    Value::Float(scalar) => {
                        let factor = 10f64.powi(digits as i32);
                        let rounded = (scalar * factor).round() / factor;
                        if digits <= 0 {
                            Ok(Value::Int(rounded as i64))
                        } else {
                            Ok(Value::Float(rounded))
                        }
                    }
                    other => Err(Raised::type_error(format!(
                        "type {} doesn't define __round__",
                        other.type_name()
                    ))),
                }
            }
            "pow" => match args.len() {
                2 => scalar_arith(BinOp::Pow, &args[0], &args[1]),
                3 => {
                    let base = expect_int(&args[0])?;
                    let exponent = expect_int(&args[1])?;
                    let modulus = expect_int(&args[2])?;
                    pow_mod(base, exponent, modulus).map(Value::Int)
                }
                n => Err(Raised::type_error(format!(
                    "pow expected 2 or 3 arguments, got {n}"
                ))),
            },
            "divmod" => {
                let [numerator, denominator] = take_args::<2>(&name, args)?;
                let quotient = scalar_arith(BinOp::FloorDiv, &numerator, &denominator)?;
                let remainder = scalar_arith(BinOp::Mod, &numerator, &denominator)?;
                Ok(Value::list(vec![quotient, remainder]))
            }
            "all" | "any" => {
                let [value] = take_args::<1>(&name, args)?;
                let items = self.iter_values(&value)?;
                let mut result = name == "all";
                for item in items {
                    let truthy = item.is_truthy()?;
                    if name == "all" && !truthy {
                        result = false;
                        break;
                    }
                    if name == "any" && truthy {
                        result = true;
                        break;
                    }
                }
                Ok(Value::Bool(result))
            }
            "list" => {
                if args.is_empty() {
                    return Ok(Value::list(Vec::new()));
                }
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::list(self.iter_values(&value)?))
            }
            "dict" => {
                if args.is_empty() {
                    Ok(Value::dict(Vec::new()))
                } else {
                    Err(Raised::type_error("dict() takes no arguments here"))
                }
            }
            // sets and tuples are list-backed in this dialect; set()
            // deduplicates while preserving first-seen order
            "set" | "frozenset" => {
                if args.is_empty() {
                    return Ok(Value::list(Vec::new()));
                }
                let [value] = take_args::<1>(&name, args)?;
                let mut unique: Vec<Value> = Vec::new();
                for item in self.iter_values(&value)? {
                    if !unique.iter().any(|seen| seen.loose_eq(&item)) {
                        unique.push(item);
                    }
                }
                Ok(Value::list(unique))
            }
            "tuple" => {
                if args.is_empty() {
                    return Ok(Value::list(Vec::new()));
                }
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::list(self.iter_values(&value)?))
            }
            "str" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Str(value.render()))
            }
            "int" => {
                let [value] = take_args::<1>(&name, args)?;
                match value {
                    Value::Int(scalar) => Ok(Value::Int(scalar)),
                    Value::Bool(scalar) => Ok(Value::Int(i64::from(scalar))),
                    Value::Float(scalar) => Ok(Value::Int(scalar.trunc() as i64)),
                    Value::Str(text) => text.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        Raised::value_error(format!(
                            "invalid literal for int() with base 10: '{text}'"
                        ))
                    }),
                    other => Err(Raised::type_error(format!(
                        "int() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            "float" => {
                let [value] = take_args::<1>(&name, args)?;
                match value {
                    Value::Int(scalar) => Ok(Value::Float(scalar as f64)),
                    Value::Bool(scalar) => Ok(Value::Float(f64::from(u8::from(scalar)))),
                    Value::Float(scalar) => Ok(Value::Float(scalar)),
                    Value::Str(text) => text.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        Raised::value_error(format!("could not convert string to float: '{text}'"))
                    }),
                    other => Err(Raised::type_error(format!(
                        "float() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            "bool" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Bool(value.is_truthy()?))
            }
            "complex" => {
                let (real, imag) = match args.len() {
                    0 => (0.0, 0.0),
                    1 => (expect_float(&args[0])?, 0.0),
                    2 => (expect_float(&args[0])?, expect_float(&args[1])?),
                    n => {
                        return Err(Raised::type_error(format!(
                            "complex expected at most 2 arguments, got {n}"
                        )))
                    }
                };
                if imag != 0.0 {
                    return Err(Raised::type_error(
                        "complex values with a nonzero imaginary part are not supported",
                    ));
                }
                Ok(Value::Float(real))
            }
            "chr" => {
                let [value] = take_args::<1>(&name, args)?;
                let code = expect_int(&value)?;
                u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .map(|c| Value::Str(c.to_string()))
                    .ok_or_else(|| Raised::value_error("chr() arg not in range(0x110000)"))
            }
            "ord" => {
                let [value] = take_args::<1>(&name, args)?;
                let Value::Str(text) = &value else {
                    return Err(Raised::type_error(format!(
                        "ord() expected string of length 1, but {} found",
                        value.type_name()
                    )));
                };
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Value::Int(i64::from(u32::from(c)))),
                    _ => Err(Raised::type_error(format!(
                        "ord() expected a character, but string of length {} found",
                        text.chars().count()
                    ))),
                }
            }
            "ascii" => {
                let [value] = take_args::<1>(&name, args)?;
                let escaped: String = value
                    .repr()
                    .chars()
                    .map(|c| {
                        if c.is_ascii() {
                            c.to_string()
                        } else if u32::from(c) <= 0xFFFF {
                            format!("\\u{:04x}", u32::from(c))
                        } else {
                            format!("\\U{:08x}", u32::from(c))
                        }
                    })
                    .collect();
                Ok(Value::Str(escaped))
            }
            "repr" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Str(value.repr()))
            }
            "format" => {
                let (value, spec) = match args.len() {
                    1 => (args[0].clone(), String::new()),
                    2 => {
                        let Value::Str(spec) = &args[1] else {
                            return Err(Raised::type_error("format spec must be a string"));
                        };
                        (args[0].clone(), spec.clone())
                    }
                    n => {
                        return Err(Raised::type_error(format!(
                            "format expected 1 or 2 arguments, got {n}"
                        )))
                    }
                };
                apply_format_spec(&value, &spec).map(Value::Str)
            }
            "iter" => {
                let [value] = take_args::<1>(&name, args)?;
                if matches!(value, Value::Iter(_)) {
                    return Ok(value);
                }
                let items = self.iter_values(&value)?;
                Ok(Value::iterator(items))
            }
            "next" => {
                let (iterator, default) = match args.len() {
                    1 => (args[0].clone(), None),
                    2 => (args[0].clone(), Some(args[1].clone())),
                    n => {
                        return Err(Raised::type_error(format!(
                            "next expected 1 or 2 arguments, got {n}"
                        )))
                    }
                };
                let Value::Iter(state) = &iterator else {
                    return Err(Raised::type_error(format!(
                        "'{}' object is not an iterator",
                        iterator.type_name()
                    )));
                };
                let mut state = state.borrow_mut();
                if state.pos < state.items.len() {
                    let item = state.items[state.pos].clone();
                    state.pos += 1;
                    Ok(item)
                } else {
                    default.ok_or_else(|| Raised::new("StopIteration", "iterator exhausted"))
                }
            }
            "slice" => {
                let (start, stop, step) = match args.len() {
                    1 => (None, slice_bound(&args[0])?, None),
                    2 => (slice_bound(&args[0])?, slice_bound(&args[1])?, None),
                    3 => (
                        slice_bound(&args[0])?,
                        slice_bound(&args[1])?,
                        slice_bound(&args[2])?,
                    ),
                    n => {
                        return Err(Raised::type_error(format!(
                            "slice expected 1 to 3 arguments, got {n}"
                        )))
                    }
                };
                Ok(Value::Slice { start, stop, step })
            }
            "print" => {
                let rendered = args
                    .iter()
                    .map(Value::render)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.printed.push_str(&rendered);
                self.printed.push('\n');
                Ok(Value::None)
            }
            "type" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Str(value.type_name().to_owned()))
            }
            "isinstance" => {
                let [value, expected] = take_args::<2>(&name, args)?;
                let matches = match &expected {
                    Value::Builtin(type_name) => isinstance_matches(&value, type_name),
                    Value::List(candidates) => candidates.borrow().iter().any(|candidate| {
                        matches!(candidate, Value::Builtin(type_name) if isinstance_matches(&value, type_name))
                    }),
                    _ => {
                        return Err(Raised::type_error(
                            "isinstance() arg 2 must be a type or list of types",
                        ))
                    }
                };
                Ok(Value::Bool(matches))
            }
            "issubclass" => {
                let [candidate, parent] = take_args::<2>(&name, args)?;
                let (Value::Builtin(candidate), Value::Builtin(parent)) = (&candidate, &parent)
                else {
                    return Err(Raised::type_error("issubclass() arguments must be types"));
                };
                let result = candidate == parent
                    || (candidate.as_str() == "bool" && parent.as_str() == "int");
                Ok(Value::Bool(result))
            }
            "callable" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Bool(matches!(
                    value,
                    Value::Function(_) | Value::Builtin(_) | Value::BoundMethod { .. }
                )))
            }
            "id" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Int(identity_of(&value)?))
            }
            "hash" => {
                let [value] = take_args::<1>(&name, args)?;
                hash_value(&value).map(Value::Int)
            }
            "math.sqrt" => {
                let [value] = take_args::<1>(&name, args)?;
                let scalar = expect_float(&value)?;
                if scalar < 0.0 {
                    return Err(Raised::value_error("math domain error"));
                }
                Ok(Value::Float(scalar.sqrt()))
            }
            "math.floor" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Int(expect_float(&value)?.floor() as i64))
            }
            "math.ceil" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Int(expect_float(&value)?.ceil() as i64))
            }
            "math.exp" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Float(expect_float(&value)?.exp()))
            }
            "math.log" => match args.len() {
                1 => {
                    let scalar = expect_float(&args[0])?;
                    if scalar <= 0.0 {
                        return Err(Raised::value_error("math domain error"));
                    }
                    Ok(Value::Float(scalar.ln()))
                }
                2 => {
                    let scalar = expect_float(&args[0])?;
                    let base = expect_float(&args[1])?;
                    Ok(Value::Float(scalar.log(base)))
                }
                n => Err(Raised::type_error(format!(
                    "math.log expected 1 or 2 arguments, got {n}"
                ))),
            },
            "math.log10" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Float(expect_float(&value)?.log10()))
            }
            "math.fabs" => {
                let [value] = take_args::<1>(&name, args)?;
                Ok(Value::Float(expect_float(&value)?.abs()))
            }
            "math.pow" => {
                let [base, exponent] = take_args::<2>(&name, args)?;
                Ok(Value::Float(
                    expect_float(&base)?.powf(expect_float(&exponent)?),
                ))
            }
            "np.where" => {
                let [cond, if_true, if_false] = take_args::<3>(&name, args)?;
                np_where(cond, if_true, if_false)
            }
            "np.abs" => self.call_builtin("abs".to_owned(), args),
            "np.sqrt" | "np.log" | "np.exp" => {
                let [value] = take_args::<1>(&name, args)?;
                let op = name.trim_start_matches("np.");
                if matches!(value, Value::Series(_)) {
                    return series_float_map(value, op);
                }
                let scalar = expect_float(&value)?;
                let result = match op {
                    "sqrt" => scalar.sqrt(),
                    "log" => scalar.ln(),
                    _ => scalar.exp(),
                };
                Ok(Value::Float(result))
            }
            "pd.isna" | "pd.notna" => {
                let [value] = take_args::<1>(&name, args)?;
                let negate = name == "pd.notna";
                match value {
                    Value::Series(series) => {
                        let mask = if negate {
                            series.is_not_null()
                        } else {
                            series.is_null()
                        };
                        Ok(Value::Series(
                            mask.with_name(series.name().clone()).into_series(),
                        ))
                    }
                    Value::None => Ok(Value::Bool(!negate)),
                    Value::Float(scalar) if scalar.is_nan() => Ok(Value::Bool(!negate)),
                    _ => Ok(Value::Bool(negate)),
                }
            }
            other => Err(Raised::name_error(other)),
        }
    }

    // Methods

    fn call_method(
        &mut self,
        target: &Value,
        method: String,
        args: Vec<Value>,
    ) -> Result<Value, Raised> {
        match target {
            Value::Frame(df) => match method.as_str() {
                "head" | "tail" => {
                    let count = match args.len() {
                        0 => 5usize,
                        1 => expect_int(&args[0])?.max(0) as usize,
                        n => {
                            return Err(Raised::type_error(format!(
                                "{method}() expected at most 1 argument, got {n}"
                            )))
                        }
                    };
                    let df = df.borrow();
                    let taken = if method == "head" {
                        df.head(Some(count))
                    } else {
                        df.tail(Some(count))
                    };
                    Ok(Value::frame(taken))
                }
                "copy" => Ok(Value::frame(df.borrow().clone())),
                "drop" => {
                    let [column] = take_args::<1>(&method, args)?;
                    let Value::Str(column) = column else {
                        return Err(Raised::type_error("drop() expects a column name"));
                    };
                    let dropped = df
                        .borrow()
                        .drop(column.as_str())
                        .map_err(|_| Raised::key_error(&column))?;
                    Ok(Value::frame(dropped))
                }
                other => Err(Raised::attribute_error(format!(
                    "'DataFrame' object has no attribute '{other}'"
                ))),
            },
            Value::Series(series) => series_method(series, &method, args),
            Value::Str(text) => str_method(text, &method, args),
            Value::List(items) => match method.as_str() {
                "append" => {
                    let [value] = take_args::<1>(&method, args)?;
                    items.borrow_mut().push(value);
                    Ok(Value::None)
                }
                other => Err(Raised::attribute_error(format!(
                    "'list' object has no attribute '{other}'"
                ))),
            },
            Value::Dict(items) => match method.as_str() {
                "keys" => Ok(Value::list(
                    items.borrow().iter().map(|(key, _)| key.clone()).collect(),
                )),
                "values" => Ok(Value::list(
                    items
                        .borrow()
                        .iter()
                        .map(|(_, value)| value.clone())
                        .collect(),
                )),
                "items" => Ok(Value::list(
                    items
                        .borrow()
                        .iter()
                        .map(|(key, value)| Value::list(vec![key.clone(), value.clone()]))
                        .collect(),
                )),
                "get" => {
                    let (key, default) = match args.len() {
                        1 => (args[0].clone(), Value::None),
                        2 => (args[0].clone(), args[1].clone()),
                        n => {
                            return Err(Raised::type_error(format!(
                                "get expected 1 or 2 arguments, got {n}"
                            )))
                        }
                    };
                    Ok(items
                        .borrow()
                        .iter()
                        .find(|(candidate, _)| candidate.loose_eq(&key))
                        .map(|(_, value)| value.clone())
                        .unwrap_or(default))
                }
                other => Err(Raised::attribute_error(format!(
                    "'dict' object has no attribute '{other}'"
                ))),
            },
            other => Err(Raised::type_error(format!(
                "'{}' object has no methods",
                other.type_name()
            ))),
        }
    }

    // Error plumbing

    fn err(&self, raised: Raised) -> EvalError {
        EvalError {
            error_type: raised.error_type,
            message: raised.message,
            frames: vec![FrameInfo {
                function: self.current_function(),
                line: self.current_line,
            }],
        }
    }

    fn current_function(&self) -> String {
        self.function_stack
            .last()
            .cloned()
            .unwrap_or_else(|| "<module>".to_owned())
    }
}

fn canonical_module(name: &str) -> String {
    match name {
        "pd" => "pandas".to_owned(),
        "np" => "numpy".to_owned(),
        other => other.to_owned(),
    }
}

fn anyvalue_to_value(any: AnyValue) -> Value {
    match any {
        AnyValue::Null => Value::None,
        AnyValue::Boolean(value) => Value::Bool(value),
        AnyValue::Int8(value) => Value::Int(i64::from(value)),
        AnyValue::Int16(value) => Value::Int(i64::from(value)),
        AnyValue::Int32(value) => Value::Int(i64::from(value)),
        AnyValue::Int64(value) => Value::Int(value),
        AnyValue::UInt8(value) => Value::Int(i64::from(value)),
        AnyValue::UInt16(value) => Value::Int(i64::from(value)),
        AnyValue::UInt32(value) => Value::Int(i64::from(value)),
        AnyValue::UInt64(value) => Value::Int(value as i64),
        AnyValue::Float32(value) => Value::Float(f64::from(value)),
        AnyValue::Float64(value) => Value::Float(value),
        AnyValue::String(value) => Value::Str(value.to_owned()),
        AnyValue::StringOwned(value) => Value::Str(value.to_string()),
        other => Value::Str(format!("{other}")),
    }
}

fn normalize_index(index: i64, len: usize) -> Result<usize, Raised> {
    let adjusted = if index < 0 { index + len as i64 } else { index };
    if adjusted < 0 || adjusted as usize >= len {
        return Err(Raised::new("IndexError", "index out of range"));
    }
    Ok(adjusted as usize)
}

fn take_args<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], Raised> {
    let count = args.len();
    args.try_into().map_err(|_| {
        Raised::type_error(format!("{name}() expected {N} argument(s), got {count}"))
    })
}

fn expect_int(value: &Value) -> Result<i64, Raised> {
    match value {
        Value::Int(scalar) => Ok(*scalar),
        Value::Bool(scalar) => Ok(i64::from(*scalar)),
        other => Err(Raised::type_error(format!(
            "expected an integer, got '{}'",
            other.type_name()
        ))),
    }
}

fn expect_float(value: &Value) -> Result<f64, Raised> {
    match value {
        Value::Int(scalar) => Ok(*scalar as f64),
        Value::Float(scalar) => Ok(*scalar),
        Value::Bool(scalar) => Ok(f64::from(u8::from(*scalar))),
        other => Err(Raised::type_error(format!(
            "expected a number, got '{}'",
            other.type_name()
        ))),
    }
}

fn isinstance_matches(value: &Value, type_name: &str) -> bool {
    match type_name {
        "int" => matches!(value, Value::Int(_) | Value::Bool(_)),
        "float" => matches!(value, Value::Float(_)),
        "str" => matches!(value, Value::Str(_)),
        "bool" => matches!(value, Value::Bool(_)),
        // set/frozenset/tuple values are list-backed
        "list" | "set" | "frozenset" | "tuple" => matches!(value, Value::List(_)),
        "dict" => matches!(value, Value::Dict(_)),
        _ => false,
    }
}

/// Modular exponentiation for three-argument `pow()`.
fn pow_mod(base: i64, exponent: i64, modulus: i64) -> Result<i64, Raised> {
    if exponent < 0 {
        return Err(Raised::value_error(
            "pow() 2nd argument cannot be negative when 3rd argument is specified",
        ));
    }
    if modulus == 0 {
        return Err(Raised::value_error("pow() 3rd argument cannot be 0"));
    }

    let modulus = i128::from(modulus).abs();
    let mut result = 1i128;
    let mut base = i128::from(base).rem_euclid(modulus);
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }
    Ok(result.rem_euclid(modulus) as i64)
}

fn slice_bound(value: &Value) -> Result<Option<i64>, Raised> {
    match value {
        Value::None => Ok(None),
        Value::Int(scalar) => Ok(Some(*scalar)),
        Value::Bool(scalar) => Ok(Some(i64::from(*scalar))),
        other => Err(Raised::type_error(format!(
            "slice indices must be integers or None, not '{}'",
            other.type_name()
        ))),
    }
}

/// Resolve a slice against a length, normalizing negative bounds.
fn resolve_slice(
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
    len: usize,
) -> Result<(usize, usize), Raised> {
    if !matches!(step, None | Some(1)) {
        return Err(Raised::value_error("slice steps are not supported"));
    }

    let clamp = |bound: i64| -> usize {
        let adjusted = if bound < 0 { bound + len as i64 } else { bound };
        adjusted.clamp(0, len as i64) as usize
    };
    let from = start.map_or(0, clamp);
    let to = stop.map_or(len, clamp);
    Ok((from, to.max(from)))
}

fn apply_format_spec(value: &Value, spec: &str) -> Result<String, Raised> {
    if spec.is_empty() {
        return Ok(value.render());
    }
    if let Some(precision) = spec
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix('f'))
        .and_then(|digits| digits.parse::<usize>().ok())
    {
        let scalar = expect_float(value)?;
        return Ok(format!("{scalar:.precision$}"));
    }
    if spec == "f" {
        let scalar = expect_float(value)?;
        return Ok(format!("{scalar:.6}"));
    }
    if spec == "d" {
        return Ok(expect_int(value)?.to_string());
    }
    Err(Raised::value_error(format!(
        "unsupported format spec '{spec}'"
    )))
}

/// Object identity: the allocation address for shared values, a
/// deterministic hash for immutable scalars.
fn identity_of(value: &Value) -> Result<i64, Raised> {
    match value {
        Value::List(items) => Ok(Rc::as_ptr(items) as usize as i64),
        Value::Dict(items) => Ok(Rc::as_ptr(items) as usize as i64),
        Value::Frame(df) => Ok(Rc::as_ptr(df) as usize as i64),
        Value::Iter(state) => Ok(Rc::as_ptr(state) as usize as i64),
        Value::Function(function) => Ok(Rc::as_ptr(function) as usize as i64),
        other => hash_value(other),
    }
}

fn hash_value(value: &Value) -> Result<i64, Raised> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    match value {
        Value::None => Ok(0),
        Value::Bool(scalar) => Ok(i64::from(*scalar)),
        Value::Int(scalar) => Ok(*scalar),
        Value::Float(scalar) => {
            if scalar.fract() == 0.0 && scalar.abs() < i64::MAX as f64 {
                Ok(*scalar as i64)
            } else {
                let mut hasher = DefaultHasher::new();
                scalar.to_bits().hash(&mut hasher);
                Ok(hasher.finish() as i64)
            }
        }
        Value::Str(text) => {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            Ok(hasher.finish() as i64)
        }
        other => Err(Raised::type_error(format!(
            "unhashable type: '{}'",
            other.type_name()
        ))),
    }
}

fn scalar_cmp(left: &Value, right: &Value) -> Result<Ordering, Raised> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => {
            let a = expect_float(left)?;
            let b = expect_float(right)?;
            Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal))
        }
    }
}

// Column-wise operand handling. Series are normalized into plain
// vectors so every elementwise rule lives in one place.

enum Operand {
    Ints(Vec<Option<i64>>),
    Floats(Vec<Option<f64>>),
    Strs(Vec<Option<String>>),
    Bools(Vec<Option<bool>>),
    IntScalar(i64),
    FloatScalar(f64),
    StrScalar(String),
}

impl Operand {
    fn from_value(value: &Value) -> Result<Operand, Raised> {
        match value {
            Value::Int(scalar) => Ok(Operand::IntScalar(*scalar)),
            Value::Bool(scalar) => Ok(Operand::IntScalar(i64::from(*scalar))),
            Value::Float(scalar) => Ok(Operand::FloatScalar(*scalar)),
            Value::Str(scalar) => Ok(Operand::StrScalar(scalar.clone())),
            Value::Series(series) => match series.dtype() {
                dtype if dtype.is_integer() => {
                    let cast = series
                        .cast(&DataType::Int64)
                        .map_err(|error| Raised::type_error(error.to_string()))?;
                    Ok(Operand::Ints(
                        cast.i64()
                            .map_err(|error| Raised::type_error(error.to_string()))?
                            .into_iter()
                            .collect(),
                    ))
                }
                dtype if dtype.is_float() => {
                    let cast = series
                        .cast(&DataType::Float64)
                        .map_err(|error| Raised::type_error(error.to_string()))?;
                    Ok(Operand::Floats(
                        cast.f64()
                            .map_err(|error| Raised::type_error(error.to_string()))?
                            .into_iter()
                            .collect(),
                    ))
                }
                DataType::String => Ok(Operand::Strs(
                    series
                        .str()
                        .map_err(|error| Raised::type_error(error.to_string()))?
                        .into_iter()
                        .map(|item| item.map(str::to_owned))
                        .collect(),
                )),
                DataType::Boolean => Ok(Operand::Bools(
                    series
                        .bool()
                        .map_err(|error| Raised::type_error(error.to_string()))?
                        .into_iter()
                        .collect(),
                )),
                other => Err(Raised::type_error(format!(
                    "unsupported column type {other:?} in expression"
                ))),
            },
            other => Err(Raised::type_error(format!(
                "unsupported operand type '{}'",
                other.type_name()
            ))),
        }
    }

    fn len(&self) -> Option<usize> {
        match self {
            Operand::Ints(values) => Some(values.len()),
            Operand::Floats(values) => Some(values.len()),
            Operand::Strs(values) => Some(values.len()),
            Operand::Bools(values) => Some(values.len()),
            _ => None,
        }
    }

    fn is_stringish(&self) -> bool {
        matches!(self, Operand::Strs(_) | Operand::StrScalar(_))
    }

    fn is_intish(&self) -> bool {
        matches!(self, Operand::Ints(_) | Operand::IntScalar(_))
    }

    fn int_at(&self, index: usize) -> Option<i64> {
        match self {
            Operand::Ints(values) => values[index],
            Operand::IntScalar(scalar) => Some(*scalar),
            _ => None,
        }
    }

    fn float_at(&self, index: usize) -> Option<f64> {
        match self {
            Operand::Ints(values) => values[index].map(|v| v as f64),
            Operand::Floats(values) => values[index],
            Operand::Bools(values) => values[index].map(|v| f64::from(u8::from(v))),
            Operand::IntScalar(scalar) => Some(*scalar as f64),
            Operand::FloatScalar(scalar) => Some(*scalar),
            _ => None,
        }
    }

    fn str_at(&self, index: usize) -> Option<String> {
        match self {
            Operand::Strs(values) => values[index].clone(),
            Operand::StrScalar(scalar) => Some(scalar.clone()),
            _ => None,
        }
    }
}

fn series_name(left: &Value, right: &Value) -> PlSmallStr {
    if let Value::Series(series) = left {
        return series.name().clone();
    }
    if let Value::Series(series) = right {
        return series.name().clone();
    }
    PlSmallStr::from_static("")
}

fn binary_op(op: BinOp, left: Value, right: Value) -> Result<Value, Raised> {
    let involves_series = matches!(left, Value::Series(_)) || matches!(right, Value::Series(_));
    if involves_series {
        return series_binary(op, &left, &right);
    }

    match (op, &left, &right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (BinOp::Mul, Value::Str(a), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(a)) => {
            Ok(Value::Str(a.repeat((*n).max(0) as usize)))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut combined = a.borrow().clone();
            combined.extend(b.borrow().iter().cloned());
            Ok(Value::list(combined))
        }
        _ => scalar_arith(op, &left, &right),
    }
}

fn scalar_arith(op: BinOp, left: &Value, right: &Value) -> Result<Value, Raised> {
    let both_int = matches!(left, Value::Int(_) | Value::Bool(_))
        && matches!(right, Value::Int(_) | Value::Bool(_));

    if both_int && op != BinOp::Div {
        let a = expect_int(left)?;
        let b = expect_int(right)?;
        return int_arith(op, a, b).map(Value::Int);
    }

    let type_mismatch = || {
        Raised::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    };
    let a = expect_float(left).map_err(|_| type_mismatch())?;
    let b = expect_float(right).map_err(|_| type_mismatch())?;
    float_arith(op, a, b).map(Value::Float)
}

fn int_arith(op: BinOp, a: i64, b: i64) -> Result<i64, Raised> {
    let overflow = || Raised::new("OverflowError", "integer result too large");
    match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow),
        BinOp::FloorDiv => {
            if b == 0 {
                Err(Raised::new(
                    "ZeroDivisionError",
                    "integer division or modulo by zero",
                ))
            } else {
                Ok(a.div_euclid(b))
            }
        }
        BinOp::Mod => {
            if b == 0 {
                Err(Raised::new(
                    "ZeroDivisionError",
                    "integer division or modulo by zero",
                ))
            } else {
                Ok(a.rem_euclid(b))
            }
        }
        BinOp::Pow => {
            if b < 0 {
                return Err(Raised::value_error(
                    "negative integer exponents are not supported; use a float base",
                ));
            }
            let exponent = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exponent).ok_or_else(overflow)
        }
        BinOp::Div => unreachable!("integer division is routed to the float path"),
    }
}

fn float_arith(op: BinOp, a: f64, b: f64) -> Result<f64, Raised> {
    match op {
        BinOp::Add => Ok(a + b),
        BinOp::Sub => Ok(a - b),
        BinOp::Mul => Ok(a * b),
        BinOp::Div => {
            if b == 0.0 {
                Err(Raised::new("ZeroDivisionError", "division by zero"))
            } else {
                Ok(a / b)
            }
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                Err(Raised::new("ZeroDivisionError", "float floor division by zero"))
            } else {
                Ok((a / b).floor())
            }
        }
        BinOp::Mod => {
            if b == 0.0 {
                Err(Raised::new("ZeroDivisionError", "float modulo"))
            } else {
                Ok(a.rem_euclid(b))
            }
        }
        BinOp::Pow => Ok(a.powf(b)),
    }
}

fn series_binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, Raised> {
    let name = series_name(left, right);
    let l = Operand::from_value(left)?;
    let r = Operand::from_value(right)?;

    let length = match (l.len(), r.len()) {
        (Some(a), Some(b)) if a != b => {
            return Err(Raised::value_error(format!(
                "cannot combine columns of different lengths ({a} and {b})"
            )))
        }
        (Some(a), _) => a,
        (_, Some(b)) => b,
        _ => unreachable!("at least one operand is a series"),
    };

    if l.is_stringish() || r.is_stringish() {
        if op != BinOp::Add || !(l.is_stringish() && r.is_stringish()) {
            return Err(Raised::type_error(format!(
                "unsupported operand type(s) for {} on text columns",
                op.symbol()
            )));
        }
        let values = (0..length)
            .map(|index| match (l.str_at(index), r.str_at(index)) {
                (Some(a), Some(b)) => Some(format!("{a}{b}")),
                _ => None,
            })
            .collect::<Vec<_>>();
        return Ok(Value::Series(Series::new(name, values)));
    }

    if l.is_intish() && r.is_intish() && op != BinOp::Div {
        let mut values = Vec::with_capacity(length);
        for index in 0..length {
            let cell = match (l.int_at(index), r.int_at(index)) {
                (Some(a), Some(b)) => Some(int_arith(op, a, b)?),
                _ => None,
            };
            values.push(cell);
        }
        return Ok(Value::Series(Series::new(name, values)));
    }

    let mut values = Vec::with_capacity(length);
    for index in 0..length {
        let cell = match (l.float_at(index), r.float_at(index)) {
            (Some(a), Some(b)) => match op {
                // elementwise division by zero follows IEEE semantics
                BinOp::Div if b == 0.0 => Some(f64::INFINITY * a.signum()),
                _ => Some(float_arith(op, a, b)?),
            },
            _ => None,
        };
        values.push(cell);
    }
    Ok(Value::Series(Series::new(name, values)))
}

fn compare_op(op: CmpOp, left: Value, right: Value) -> Result<Value, Raised> {
    if matches!(left, Value::Series(_)) || matches!(right, Value::Series(_)) {
        return series_compare(op, &left, &right);
    }

    match op {
        CmpOp::Eq => Ok(Value::Bool(left.loose_eq(&right))),
        CmpOp::NotEq => Ok(Value::Bool(!left.loose_eq(&right))),
        CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq => {
            let ordering = scalar_cmp(&left, &right)?;
            let result = match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::LtEq => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::GtEq => ordering != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        CmpOp::In | CmpOp::NotIn => {
            let contains = membership(&left, &right)?;
            Ok(Value::Bool(if op == CmpOp::In {
                contains
            } else {
                !contains
            }))
        }
    }
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, Raised> {
    match haystack {
        Value::List(items) => Ok(items.borrow().iter().any(|item| item.loose_eq(needle))),
        Value::Dict(items) => Ok(items
            .borrow()
            .iter()
            .any(|(key, _)| key.loose_eq(needle))),
        Value::Str(text) => match needle {
            Value::Str(sub) => Ok(text.contains(sub.as_str())),
            other => Err(Raised::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        // membership on a frame checks column names
        Value::Frame(df) => match needle {
            Value::Str(column) => Ok(df
                .borrow()
                .get_column_names()
                .iter()
                .any(|name| name.as_str() == column.as_str())),
            _ => Ok(false),
        },
        other => Err(Raised::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn series_compare(op: CmpOp, left: &Value, right: &Value) -> Result<Value, Raised> {
    if matches!(op, CmpOp::In | CmpOp::NotIn) {
        return Err(Raised::type_error(
            "membership tests are not supported on columns",
        ));
    }

    let name = series_name(left, right);
    let l = Operand::from_value(left)?;
    let r = Operand::from_value(right)?;

    let length = match (l.len(), r.len()) {
        (Some(a), Some(b)) if a != b => {
            return Err(Raised::value_error(format!(
                "cannot compare columns of different lengths ({a} and {b})"
            )))
        }
        (Some(a), _) => a,
        (_, Some(b)) => b,
        _ => unreachable!("at least one operand is a series"),
    };

    let stringish = l.is_stringish() || r.is_stringish();
    let mut values: Vec<Option<bool>> = Vec::with_capacity(length);
    for index in 0..length {
        let verdict = if stringish {
            match (l.str_at(index), r.str_at(index)) {
                (Some(a), Some(b)) => {
                    let ordering = a.cmp(&b);
                    cmp_verdict(op, ordering)
                }
                // null never compares equal, mirroring NaN semantics
                _ => op == CmpOp::NotEq,
            }
        } else {
            match (l.float_at(index), r.float_at(index)) {
                (Some(a), Some(b)) => {
                    let ordering = a.partial_cmp(&b).unwrap_or(Ordering::Greater);
                    if a.is_nan() || b.is_nan() {
                        op == CmpOp::NotEq
                    } else {
                        cmp_verdict(op, ordering)
                    }
                }
                _ => op == CmpOp::NotEq,
            }
        };
        values.push(Some(verdict));
    }

    let mask: BooleanChunked = values.into_iter().collect();
    Ok(Value::Series(mask.with_name(name).into_series()))
}

fn cmp_verdict(op: CmpOp, ordering: Ordering) -> bool {
    match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::NotEq => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::LtEq => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::GtEq => ordering != Ordering::Less,
        CmpOp::In | CmpOp::NotIn => false,
    }
}

fn list_to_series(items: &[Value], name: &str) -> Result<Series, Raised> {
    let all_intish = items
        .iter()
        .all(|item| matches!(item, Value::Int(_) | Value::Bool(_) | Value::None));
    if all_intish {
        let values = items
            .iter()
            .map(|item| match item {
                Value::Int(scalar) => Some(*scalar),
                Value::Bool(scalar) => Some(i64::from(*scalar)),
                _ => None,
            })
            .collect::<Vec<_>>();
        return Ok(Series::new(name.into(), values));
    }

    let all_numeric = items.iter().all(|item| {
        matches!(
            item,
            Value::Int(_) | Value::Bool(_) | Value::Float(_) | Value::None
        )
    });
    if all_numeric {
        let values = items
            .iter()
            .map(|item| match item {
                Value::Int(scalar) => Some(*scalar as f64),
                Value::Bool(scalar) => Some(f64::from(u8::from(*scalar))),
                Value::Float(scalar) => Some(*scalar),
                _ => None,
            })
            .collect::<Vec<_>>();
        return Ok(Series::new(name.into(), values));
    }

    let all_text = items
        .iter()
        .all(|item| matches!(item, Value::Str(_) | Value::None));
    if all_text {
        let values = items
            .iter()
            .map(|item| match item {
                Value::Str(text) => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        return Ok(Series::new(name.into(), values));
    }

    Err(Raised::type_error(
        "column values must be uniformly numeric or text",
    ))
}

fn series_abs(value: Value) -> Result<Value, Raised> {
    let Value::Series(series) = &value else {
        return Err(Raised::type_error("abs() expects a column here"));
    };
    let name = series.name().clone();
    match Operand::from_value(&value)? {
        Operand::Ints(values) => Ok(Value::Series(Series::new(
            name,
            values
                .into_iter()
                .map(|item| item.map(i64::abs))
                .collect::<Vec<_>>(),
        ))),
        Operand::Floats(values) => Ok(Value::Series(Series::new(
            name,
            values
                .into_iter()
                .map(|item| item.map(f64::abs))
                .collect::<Vec<_>>(),
        ))),
        _ => Err(Raised::type_error("abs() requires a numeric column")),
    }
}

fn series_float_map(value: Value, op: &str) -> Result<Value, Raised> {
    let Value::Series(series) = &value else {
        return Err(Raised::type_error("expected a column"));
    };
    let name = series.name().clone();
    let operand = Operand::from_value(&value)?;
    let length = operand.len().unwrap_or(0);
    let values = (0..length)
        .map(|index| {
            operand.float_at(index).map(|scalar| match op {
                "sqrt" => scalar.sqrt(),
                "log" => scalar.ln(),
                _ => scalar.exp(),
            })
        })
        .collect::<Vec<_>>();
    Ok(Value::Series(Series::new(name, values)))
}

fn np_where(cond: Value, if_true: Value, if_false: Value) -> Result<Value, Raised> {
    let Value::Series(mask) = &cond else {
        return Err(Raised::type_error("np.where() requires a boolean column"));
    };
    let name = mask.name().clone();
    let mask = mask
        .bool()
        .map_err(|_| Raised::type_error("np.where() requires a boolean column"))?
        .into_iter()
        .collect::<Vec<_>>();

    let t = Operand::from_value(&if_true)?;
    let f = Operand::from_value(&if_false)?;
    for operand in [&t, &f] {
        if let Some(len) = operand.len() {
            if len != mask.len() {
                return Err(Raised::value_error(
                    "np.where() operands must match the mask length",
                ));
            }
        }
    }

    if t.is_stringish() || f.is_stringish() {
        if !(t.is_stringish() && f.is_stringish()) {
            return Err(Raised::type_error(
                "np.where() branches must both be text or both numeric",
            ));
        }
        let values = mask
            .iter()
            .enumerate()
            .map(|(index, flag)| match flag {
                Some(true) => t.str_at(index),
                Some(false) => f.str_at(index),
                None => None,
            })
            .collect::<Vec<_>>();
        return Ok(Value::Series(Series::new(name, values)));
    }

    if t.is_intish() && f.is_intish() {
        let values = mask
            .iter()
            .enumerate()
            .map(|(index, flag)| match flag {
                Some(true) => t.int_at(index),
                Some(false) => f.int_at(index),
                None => None,
            })
            .collect::<Vec<_>>();
        return Ok(Value::Series(Series::new(name, values)));
    }

    let values = mask
        .iter()
        .enumerate()
        .map(|(index, flag)| match flag {
            Some(true) => t.float_at(index),
            Some(false) => f.float_at(index),
            None => None,
        })
        .collect::<Vec<_>>();
    Ok(Value::Series(Series::new(name, values)))
}

fn series_method(series: &Series, method: &str, args: Vec<Value>) -> Result<Value, Raised> {
    match method {
        "sum" => {
            let value = Value::Series(series.clone());
            match Operand::from_value(&value)? {
                Operand::Ints(values) => {
                    Ok(Value::Int(values.into_iter().flatten().sum()))
                }
                Operand::Floats(values) => {
                    Ok(Value::Float(values.into_iter().flatten().sum()))
                }
                Operand::Bools(values) => Ok(Value::Int(
                    values.into_iter().flatten().map(i64::from).sum(),
                )),
                _ => Err(Raised::type_error("sum() requires a numeric column")),
            }
        }
        "mean" => {
            let value = Value::Series(series.clone());
            let operand = Operand::from_value(&value)?;
            let length = operand.len().unwrap_or(0);
            let mut total = 0f64;
            let mut count = 0usize;
            for index in 0..length {
                if let Some(scalar) = operand.float_at(index) {
                    total += scalar;
                    count += 1;
                }
            }
            if count == 0 {
                Ok(Value::Float(f64::NAN))
            } else {
                Ok(Value::Float(total / count as f64))
            }
        }
        "min" | "max" => {
            let value = Value::Series(series.clone());
            let operand = Operand::from_value(&value)?;
            let length = operand.len().unwrap_or(0);
            let mut best: Option<f64> = None;
            for index in 0..length {
                if let Some(scalar) = operand.float_at(index) {
                    best = Some(match best {
                        None => scalar,
                        Some(current) if method == "min" => current.min(scalar),
                        Some(current) => current.max(scalar),
                    });
                }
            }
            match best {
                Some(scalar) => {
                    if matches!(series.dtype(), dtype if dtype.is_integer()) {
                        Ok(Value::Int(scalar as i64))
                    } else {
                        Ok(Value::Float(scalar))
                    }
                }
                None => Ok(Value::None),
            }
        }
        "abs" => series_abs(Value::Series(series.clone())),
        "fillna" => {
            let [fill] = take_args::<1>(method, args)?;
            let value = Value::Series(series.clone());
            let name = series.name().clone();
            match (Operand::from_value(&value)?, &fill) {
                (Operand::Ints(values), Value::Int(scalar)) => Ok(Value::Series(Series::new(
                    name,
                    values
                        .into_iter()
                        .map(|item| Some(item.unwrap_or(*scalar)))
                        .collect::<Vec<_>>(),
                ))),
                (Operand::Strs(values), Value::Str(scalar)) => Ok(Value::Series(Series::new(
                    name,
                    values
                        .into_iter()
                        .map(|item| Some(item.unwrap_or_else(|| scalar.clone())))
                        .collect::<Vec<_>>(),
                ))),
                (operand, fill) => {
                    let scalar = expect_float(fill)?;
                    let length = operand.len().unwrap_or(0);
                    let values = (0..length)
                        .map(|index| Some(operand.float_at(index).unwrap_or(scalar)))
                        .collect::<Vec<_>>();
                    Ok(Value::Series(Series::new(name, values)))
                }
            }
        }
        "astype" => {
            let [target] = take_args::<1>(method, args)?;
            let Value::Builtin(type_name) = &target else {
                return Err(Raised::type_error("astype() expects int, float, or str"));
            };
            let dtype = match type_name.as_str() {
                "int" => DataType::Int64,
                "float" => DataType::Float64,
                "str" => DataType::String,
                other => {
                    return Err(Raised::type_error(format!(
                        "astype() cannot cast to '{other}'"
                    )))
                }
            };
            series
                .cast(&dtype)
                .map(Value::Series)
                .map_err(|error| Raised::value_error(error.to_string()))
        }
        other => Err(Raised::attribute_error(format!(
            "'Series' object has no attribute '{other}'"
        ))),
    }
}

fn str_method(text: &str, method: &str, args: Vec<Value>) -> Result<Value, Raised> {
    match method {
        "upper" => Ok(Value::Str(text.to_uppercase())),
        "lower" => Ok(Value::Str(text.to_lowercase())),
        "strip" => Ok(Value::Str(text.trim().to_owned())),
        "split" => {
            let parts: Vec<Value> = match args.len() {
                0 => text
                    .split_whitespace()
                    .map(|part| Value::Str(part.to_owned()))
                    .collect(),
                1 => {
                    let Value::Str(separator) = &args[0] else {
                        return Err(Raised::type_error("split() separator must be a string"));
                    };
                    text.split(separator.as_str())
                        .map(|part| Value::Str(part.to_owned()))
                        .collect()
                }
                n => {
                    return Err(Raised::type_error(format!(
                        "split expected at most 1 argument, got {n}"
                    )))
                }
            };
            Ok(Value::list(parts))
        }
        "replace" => {
            let [from, to] = take_args::<2>(method, args)?;
            let (Value::Str(from), Value::Str(to)) = (&from, &to) else {
                return Err(Raised::type_error("replace() arguments must be strings"));
            };
            Ok(Value::Str(text.replace(from.as_str(), to)))
        }
        "startswith" | "endswith" => {
            let [prefix] = take_args::<1>(method, args)?;
            let Value::Str(prefix) = &prefix else {
                return Err(Raised::type_error(format!(
                    "{method}() argument must be a string"
                )));
            };
            let result = if method == "startswith" {
                text.starts_with(prefix.as_str())
            } else {
                text.ends_with(prefix.as_str())
            };
            Ok(Value::Bool(result))
        }
        other => Err(Raised::attribute_error(format!(
            "'str' object has no attribute '{other}'"
        ))),
    }
}
