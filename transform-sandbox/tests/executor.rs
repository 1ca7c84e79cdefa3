//! End-to-end executor tests against the real runner binary.

use std::time::{Duration, Instant};

use polars::prelude::*;
use transform_sandbox::{SandboxErrorKind, SandboxExecutor, SandboxLimits};

fn runner_path() -> &'static str {
    env!("CARGO_BIN_EXE_transform-runner")
}

fn executor(job_id: i64, limits: SandboxLimits) -> SandboxExecutor {
    SandboxExecutor::new(job_id, limits).with_runner(runner_path())
}

fn sales_frame() -> DataFrame {
    DataFrame::new(vec![
        Series::new("price".into(), &[10i64, 20, 30]).into_column(),
        Series::new("qty".into(), &[2i64, 3, 4]).into_column(),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_derived_column_end_to_end() {
    let report = executor(1, SandboxLimits::default())
        .execute(
            "df[\"total\"] = df[\"price\"] * df[\"qty\"]\nreturn df\n",
            sales_frame(),
        )
        .await;

    let success = report.outcome.expect("execution should succeed");
    assert_eq!(success.row_count, 3);
    assert_eq!(success.columns, vec!["price", "qty", "total"]);

    let totals: Vec<Option<i64>> = success
        .dataframe
        .column("total")
        .unwrap()
        .as_materialized_series()
        .i64()
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(totals, vec![Some(20), Some(60), Some(120)]);
    assert!(report.log.contains("SUCCESS"));
}

#[tokio::test]
async fn test_identity_transform_preserves_types() {
    let df = DataFrame::new(vec![
        Series::new("n".into(), &[1i64, 2]).into_column(),
        Series::new("x".into(), &[0.5f64, 1.5]).into_column(),
        Series::new("s".into(), &[Some("a"), None]).into_column(),
        Series::new("b".into(), &[true, false]).into_column(),
    ])
    .unwrap();

    let report = executor(2, SandboxLimits::default())
        .execute("return df\n", df)
        .await;

    let success = report.outcome.expect("identity should succeed");
    assert_eq!(success.columns, vec!["n", "x", "s", "b"]);
    let out = &success.dataframe;
    assert_eq!(out.column("n").unwrap().dtype(), &DataType::Int64);
    assert_eq!(out.column("x").unwrap().dtype(), &DataType::Float64);
    assert_eq!(out.column("s").unwrap().dtype(), &DataType::String);
    assert_eq!(out.column("b").unwrap().dtype(), &DataType::Boolean);
}

#[tokio::test]
async fn test_import_os_is_statically_rejected() {
    let report = executor(3, SandboxLimits::default())
        .execute("import os\nreturn df\n", sales_frame())
        .await;

    let failure = report.outcome.expect_err("import os must be rejected");
    assert_eq!(failure.kind, SandboxErrorKind::StaticReject);
    assert!(failure.message.contains("not allowed"));
    // rejected before any process is spawned
    assert!(report.log.contains("COMPILATION ERROR"));
}

#[tokio::test]
async fn test_non_frame_return_is_bad_return_type() {
    let report = executor(4, SandboxLimits::default())
        .execute("return \"hello\"\n", sales_frame())
        .await;

    let failure = report.outcome.expect_err("string return must fail");
    assert_eq!(failure.kind, SandboxErrorKind::BadReturnType);
    assert!(failure.message.contains("DataFrame"));
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let limits = SandboxLimits {
        timeout: Duration::from_secs(2),
        max_memory_mb: 512,
    };
    let started = Instant::now();
    let report = executor(5, limits)
        .execute("while True: pass\n", sales_frame())
        .await;
    let elapsed = started.elapsed();

    let failure = report.outcome.expect_err("infinite loop must time out");
    assert_eq!(failure.kind, SandboxErrorKind::Timeout);
    // killed shortly after the 2s limit, well under the default 60s
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
}

#[tokio::test]
async fn test_unbounded_allocation_exceeds_memory_cap() {
    let limits = SandboxLimits {
        timeout: Duration::from_secs(60),
        max_memory_mb: 64,
    };
    let report = executor(6, limits)
        .execute(
            "x = range(50000000)\ny = len(x)\nreturn df\n",
            sales_frame(),
        )
        .await;

    let failure = report.outcome.expect_err("allocation must exceed the cap");
    assert!(
        matches!(
            failure.kind,
            SandboxErrorKind::MemoryExceeded | SandboxErrorKind::Timeout
        ),
        "unexpected kind: {:?}",
        failure.kind
    );
}

#[tokio::test]
async fn test_runtime_error_carries_filtered_traceback() {
    let report = executor(7, SandboxLimits::default())
        .execute("return df[\"absent\"]\n", sales_frame())
        .await;

    let failure = report.outcome.expect_err("missing column must fail");
    assert_eq!(failure.kind, SandboxErrorKind::RuntimeError);
    assert!(failure.message.contains("KeyError"));
    let traceback = failure.traceback.expect("traceback expected");
    assert!(traceback.contains("<user_script>"));
    assert!(!traceback.contains("runner.rs"));
}

#[tokio::test]
async fn test_missing_runner_binary_is_a_runtime_failure() {
    let report = SandboxExecutor::new(8, SandboxLimits::default())
        .with_runner("/nonexistent/transform-runner")
        .execute("return df\n", sales_frame())
        .await;

    let failure = report.outcome.expect_err("spawn must fail");
    assert_eq!(failure.kind, SandboxErrorKind::RuntimeError);
    assert!(failure.message.contains("launch"));
}

#[tokio::test]
async fn test_print_output_lands_in_log() {
    let report = executor(9, SandboxLimits::default())
        .execute("print(\"checkpoint\")\nreturn df\n", sales_frame())
        .await;

    assert!(report.outcome.is_ok());
    assert!(report.log.contains("Output: checkpoint"));
}
