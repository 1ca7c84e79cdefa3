//! The wire contract between the orchestrating process and the
//! isolated runner.
//!
//! One JSON envelope each way: the request carries the compiled
//! program, the input frame, and the restricted symbol table; the
//! response carries either the transformed frame or a structured
//! failure. Frames travel through polars' columnar serde
//! representation, which round-trips column types without any
//! code-bearing serialization format.

use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};

use crate::lang::ast::Program;
use crate::lang::interp::{PRELOADED_MODULES, SAFE_BUILTINS};

/// The symbol table the runner is allowed to install. Shipping it in
/// the envelope keeps the runner free of policy: it binds exactly what
/// it is told, nothing more.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictedGlobals {
    pub modules: Vec<String>,
    pub builtins: Vec<String>,
}

impl Default for RestrictedGlobals {
    fn default() -> Self {
        Self {
            modules: PRELOADED_MODULES.iter().map(|name| (*name).to_owned()).collect(),
            builtins: SAFE_BUILTINS.iter().map(|name| (*name).to_owned()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: Program,
    pub dataframe: DataFrame,
    pub globals: RestrictedGlobals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub success: bool,
    #[serde(default)]
    pub dataframe: Option<DataFrame>,
    #[serde(default)]
    pub row_count: Option<usize>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    /// Output produced by user `print()` calls.
    #[serde(default)]
    pub printed: String,
}

impl ExecutionResponse {
    pub fn success(dataframe: DataFrame, printed: String) -> Self {
        let row_count = dataframe.height();
        let columns = dataframe
            .get_column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        Self {
            success: true,
            row_count: Some(row_count),
            columns: Some(columns),
            dataframe: Some(dataframe),
            error: None,
            error_type: None,
            traceback: None,
            printed,
        }
    }

    pub fn failure(
        error_type: &str,
        error: impl Into<String>,
        traceback: Option<String>,
        printed: String,
    ) -> Self {
        Self {
            success: false,
            dataframe: None,
            row_count: None,
            columns: None,
            error: Some(error.into()),
            error_type: Some(error_type.to_owned()),
            traceback,
            printed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::compile;
    use polars::prelude::*;

    #[test]
    fn test_request_round_trips_frame_types() {
        let df = DataFrame::new(vec![
            Series::new("a".into(), &[1i64, 2]).into_column(),
            Series::new("b".into(), &[Some(1.5f64), None]).into_column(),
            Series::new("c".into(), &[Some("x"), None]).into_column(),
        ])
        .unwrap();

        let request = ExecutionRequest {
            code: compile("return df\n").unwrap(),
            dataframe: df.clone(),
            globals: RestrictedGlobals::default(),
        };

        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: ExecutionRequest = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.dataframe.height(), 2);
        assert_eq!(decoded.dataframe.column("a").unwrap().dtype(), &DataType::Int64);
        assert_eq!(decoded.dataframe.column("b").unwrap().dtype(), &DataType::Float64);
        assert_eq!(decoded.dataframe.column("c").unwrap().dtype(), &DataType::String);
    }

    #[test]
    fn test_response_failure_shape() {
        let response =
            ExecutionResponse::failure("KeyError", "'missing'", Some("trace".into()), String::new());
        let bytes = serde_json::to_vec(&response).unwrap();
        let decoded: ExecutionResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!decoded.success);
        assert_eq!(decoded.error_type.as_deref(), Some("KeyError"));
        assert!(decoded.dataframe.is_none());
    }
}
