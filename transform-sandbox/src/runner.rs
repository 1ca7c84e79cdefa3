//! Child side of the sandbox protocol.
//!
//! Reads one request envelope from stdin, installs the restricted
//! symbol table, runs the program, calls `transform`, and writes one
//! response envelope to stdout. Anything that prevents an envelope
//! from being produced goes to stderr with a nonzero exit; the parent
//! treats that as a runtime failure with stderr as the log.

use std::io::{Read, Write};

use crate::envelope::{ExecutionRequest, ExecutionResponse};
use crate::lang::interp::{EvalError, Interpreter};
use crate::lang::value::Value;

/// Entry point used by the `transform-runner` binary. Returns the
/// process exit code.
pub fn run(mut input: impl Read, mut output: impl Write) -> i32 {
    let mut payload = Vec::new();
    if let Err(error) = input.read_to_end(&mut payload) {
        eprintln!("failed to read input envelope: {error}");
        return 1;
    }

    let request: ExecutionRequest = match serde_json::from_slice(&payload) {
        Ok(request) => request,
        Err(error) => {
            eprintln!("failed to decode input envelope: {error}");
            return 1;
        }
    };

    let response = execute(request);

    let bytes = match serde_json::to_vec(&response) {
        Ok(bytes) => bytes,
        Err(error) => {
            eprintln!("failed to serialize response envelope: {error}");
            return 1;
        }
    };
    if let Err(error) = output.write_all(&bytes).and_then(|()| output.flush()) {
        eprintln!("failed to write response envelope: {error}");
        return 1;
    }

    0
}

fn execute(request: ExecutionRequest) -> ExecutionResponse {
    let mut interp = Interpreter::with_symbols(&request.globals.modules, &request.globals.builtins);

    if let Err(error) = interp.run_program(&request.code) {
        let printed = interp.printed().to_owned();
        return failure_response(error, printed);
    }

    let Some(transform) = interp.global("transform") else {
        return ExecutionResponse::failure(
            "ValueError",
            "No 'transform' function defined in script. \
             Your code must define: def transform(df): ...",
            None,
            interp.printed().to_owned(),
        );
    };

    let result = interp.call(&transform, vec![Value::frame(request.dataframe)]);
    let printed = interp.printed().to_owned();

    match result {
        Ok(Value::Frame(df)) => {
            let df = df.borrow().clone();
            if df.height() == 0 {
                eprintln!("WARNING: transform() returned an empty frame");
            }
            ExecutionResponse::success(df, printed)
        }
        Ok(other) => ExecutionResponse::failure(
            "BadReturnType",
            format!(
                "transform() must return a DataFrame, got {}",
                other.type_name()
            ),
            None,
            printed,
        ),
        Err(error) => failure_response(error, printed),
    }
}

fn failure_response(error: EvalError, printed: String) -> ExecutionResponse {
    let traceback = format_traceback(&error);
    ExecutionResponse::failure(&error.error_type, error.message.clone(), Some(traceback), printed)
}

/// Python-style traceback over user frames only; interpreter frames
/// never appear because the interpreter never records them.
fn format_traceback(error: &EvalError) -> String {
    let mut lines = vec!["Traceback (most recent call last):".to_owned()];
    for frame in error.frames.iter().rev() {
        lines.push(format!(
            "  File \"<user_script>\", line {}, in {}",
            frame.line, frame.function
        ));
    }
    lines.push(format!("{}: {}", error.error_type, error.message));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RestrictedGlobals;
    use crate::lang::compile;
    use polars::prelude::*;

    fn request(source: &str) -> Vec<u8> {
        let df = DataFrame::new(vec![
            Series::new("price".into(), &[10i64, 20, 30]).into_column(),
            Series::new("qty".into(), &[2i64, 3, 4]).into_column(),
        ])
        .unwrap();
        serde_json::to_vec(&ExecutionRequest {
            code: compile(source).unwrap(),
            dataframe: df,
            globals: RestrictedGlobals::default(),
        })
        .unwrap()
    }

    fn run_bytes(payload: &[u8]) -> (i32, ExecutionResponse) {
        let mut output = Vec::new();
        let code = run(payload, &mut output);
        let response = serde_json::from_slice(&output).expect("runner produced no envelope");
        (code, response)
    }

    #[test]
    fn test_successful_transform_envelope() {
        let (code, response) =
            run_bytes(&request("df[\"total\"] = df[\"price\"] * df[\"qty\"]\nreturn df\n"));
        assert_eq!(code, 0);
        assert!(response.success);
        assert_eq!(response.row_count, Some(3));
        assert_eq!(
            response.columns.as_deref(),
            Some(&["price".to_owned(), "qty".to_owned(), "total".to_owned()][..])
        );
    }

    #[test]
    fn test_bad_return_type_envelope() {
        let (code, response) = run_bytes(&request("return \"hello\"\n"));
        assert_eq!(code, 0);
        assert!(!response.success);
        assert_eq!(response.error_type.as_deref(), Some("BadReturnType"));
        assert!(response.error.unwrap().contains("DataFrame"));
    }

    #[test]
    fn test_runtime_error_carries_traceback() {
        let (code, response) = run_bytes(&request("return df[\"absent\"]\n"));
        assert_eq!(code, 0);
        assert!(!response.success);
        assert_eq!(response.error_type.as_deref(), Some("KeyError"));
        let traceback = response.traceback.unwrap();
        assert!(traceback.contains("<user_script>"));
        assert!(traceback.contains("transform"));
    }

    #[test]
    fn test_malformed_input_exits_nonzero() {
        let mut output = Vec::new();
        let code = run(&b"not json"[..], &mut output);
        assert_eq!(code, 1);
        assert!(output.is_empty());
    }

    #[test]
    fn test_printed_output_travels_in_envelope() {
        let (_, response) = run_bytes(&request("print(\"inspecting\", 1)\nreturn df\n"));
        assert!(response.success);
        assert_eq!(response.printed, "inspecting 1\n");
    }
}
