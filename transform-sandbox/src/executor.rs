//! Parent side of the sandbox: compile, isolate, monitor.
//!
//! Each execution spawns a fresh `transform-runner` process with a
//! cleared environment, piped stdio, and a private scratch directory
//! as its working directory. The monitor polls roughly twice a second:
//! past the wall-clock limit the process tree is killed and the run is
//! a Timeout; past the resident-memory limit it is killed and the run
//! is a MemoryExceeded. CPU saturation is only logged.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Local;
use polars::prelude::DataFrame;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::envelope::{ExecutionRequest, ExecutionResponse, RestrictedGlobals};
use crate::lang;

const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

const RUNNER_BIN: &str = if cfg!(windows) {
    "transform-runner.exe"
} else {
    "transform-runner"
};

/// Resource caps applied to one transformation call.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_memory_mb: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_memory_mb: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxErrorKind {
    StaticReject,
    RuntimeError,
    BadReturnType,
    Timeout,
    MemoryExceeded,
    DeserializationFailure,
}

impl std::fmt::Display for SandboxErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SandboxErrorKind::StaticReject => "StaticReject",
            SandboxErrorKind::RuntimeError => "RuntimeError",
            SandboxErrorKind::BadReturnType => "BadReturnType",
            SandboxErrorKind::Timeout => "Timeout",
            SandboxErrorKind::MemoryExceeded => "MemoryExceeded",
            SandboxErrorKind::DeserializationFailure => "DeserializationFailure",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone)]
pub struct SandboxFailure {
    pub kind: SandboxErrorKind,
    pub message: String,
    pub traceback: Option<String>,
}

#[derive(Debug)]
pub struct SandboxSuccess {
    pub dataframe: DataFrame,
    pub row_count: usize,
    pub columns: Vec<String>,
}

/// What one transformation call produced, plus its execution log.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: Result<SandboxSuccess, SandboxFailure>,
    pub log: String,
}

pub struct SandboxExecutor {
    job_id: i64,
    limits: SandboxLimits,
    runner: PathBuf,
}

impl SandboxExecutor {
    pub fn new(job_id: i64, limits: SandboxLimits) -> Self {
        Self {
            job_id,
            limits,
            runner: default_runner_path(),
        }
    }

    /// Override the runner binary location (used by tests).
    pub fn with_runner(mut self, runner: impl Into<PathBuf>) -> Self {
        self.runner = runner.into();
        self
    }

    /// Run user code over a frame in a fresh isolated process.
    pub async fn execute(&self, code: &str, dataframe: DataFrame) -> ExecutionReport {
        let mut log = ExecutionLog::new();
        log.push(format!(
            "Starting sandbox execution for job {}",
            self.job_id
        ));
        log.push(format!(
            "Input frame: {} rows, {} columns",
            dataframe.height(),
            dataframe.width()
        ));

        // L1/L2: validate and compile before anything is spawned.
        let program = match lang::compile(code) {
            Ok(program) => program,
            Err(rejection) => {
                log.push(format!("COMPILATION ERROR: {rejection}"));
                return self.fail(log, SandboxErrorKind::StaticReject, rejection.message, None);
            }
        };
        log.push("Code compiled successfully".to_owned());

        let request = ExecutionRequest {
            code: program,
            dataframe,
            globals: RestrictedGlobals::default(),
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(error) => {
                log.push(format!("ERROR: failed to serialize input envelope: {error}"));
                return self.fail(
                    log,
                    SandboxErrorKind::RuntimeError,
                    format!("failed to serialize input envelope: {error}"),
                    None,
                );
            }
        };

        // The scratch directory is removed on every exit path when the
        // guard drops.
        let scratch = match tempfile::Builder::new()
            .prefix(&format!("transform-job-{}-", self.job_id))
            .tempdir()
        {
            Ok(scratch) => scratch,
            Err(error) => {
                log.push(format!("ERROR: failed to create scratch directory: {error}"));
                return self.fail(
                    log,
                    SandboxErrorKind::RuntimeError,
                    format!("failed to create scratch directory: {error}"),
                    None,
                );
            }
        };
        log.push(format!(
            "Created scratch directory: {}",
            scratch.path().display()
        ));

        let mut command = Command::new(&self.runner);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(scratch.path())
            .env_clear()
            .kill_on_drop(true);

        // Windows cannot start a process without its system variables,
        // and the runner must never open a console window.
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            for key in ["SYSTEMROOT", "TEMP", "TMP", "PATH"] {
                if let Ok(value) = std::env::var(key) {
                    command.env(key, value);
                }
            }
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let spawned = command.spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(error) => {
                log.push(format!(
                    "ERROR: failed to launch runner {}: {error}",
                    self.runner.display()
                ));
                return self.fail(
                    log,
                    SandboxErrorKind::RuntimeError,
                    format!("failed to launch sandbox runner: {error}"),
                    None,
                );
            }
        };
        let pid = child.id();
        log.push(format!("Runner started (pid {pid:?})"));

        // Send the envelope and close stdin so the runner sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            log.push(format!("Sending {} bytes to runner", payload.len()));
            if let Err(error) = stdin.write_all(&payload).await {
                log.push(format!("ERROR: failed to send envelope: {error}"));
                child.start_kill().ok();
                child.wait().await.ok();
                return self.fail(
                    log,
                    SandboxErrorKind::RuntimeError,
                    format!("failed to send data to sandbox: {error}"),
                    None,
                );
            }
            drop(stdin);
        }

        // Drain stdout/stderr concurrently; a runner producing a large
        // envelope must never block on a full pipe.
        let stdout_task = child.stdout.take().map(|mut stream| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                // the pipe may close early when the runner is killed
                stream.read_to_end(&mut buffer).await.ok();
                buffer
            })
        });
        let stderr_task = child.stderr.take().map(|mut stream| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                stream.read_to_end(&mut buffer).await.ok();
                buffer
            })
        });

        log.push(format!(
            "Monitoring runner (timeout: {}s, memory limit: {}MB)",
            self.limits.timeout.as_secs(),
            self.limits.max_memory_mb
        ));

        let started = Instant::now();
        let mut system = System::new();
        let status = loop {
            match tokio::time::timeout(MONITOR_INTERVAL, child.wait()).await {
                Ok(Ok(status)) => break status,
                Ok(Err(error)) => {
                    log.push(format!("ERROR: failed to wait on runner: {error}"));
                    return self.fail(
                        log,
                        SandboxErrorKind::RuntimeError,
                        format!("failed to wait on sandbox process: {error}"),
                        None,
                    );
                }
                Err(_) => {
                    let elapsed = started.elapsed();
                    if elapsed > self.limits.timeout {
                        log.push(format!(
                            "KILLED: timeout exceeded ({}s)",
                            self.limits.timeout.as_secs()
                        ));
                        kill_process_tree(pid, &mut child).await;
                        return self.fail(
                            log,
                            SandboxErrorKind::Timeout,
                            format!(
                                "transformation exceeded the time limit of {} seconds",
                                self.limits.timeout.as_secs()
                            ),
                            None,
                        );
                    }

                    if let Some(pid) = pid {
                        let sys_pid = Pid::from_u32(pid);
                        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
                        if let Some(process) = system.process(sys_pid) {
                            let memory_mb = process.memory() / (1024 * 1024);
                            if memory_mb > self.limits.max_memory_mb {
                                log.push(format!(
                                    "KILLED: memory limit exceeded ({memory_mb}MB > {}MB)",
                                    self.limits.max_memory_mb
                                ));
                                kill_process_tree(Some(pid), &mut child).await;
                                return self.fail(
                                    log,
                                    SandboxErrorKind::MemoryExceeded,
                                    format!(
                                        "transformation exceeded the memory limit of {}MB",
                                        self.limits.max_memory_mb
                                    ),
                                    None,
                                );
                            }

                            // saturation is expected for heavy
                            // computations, so it is never fatal
                            let cpu = process.cpu_usage();
                            if cpu > 95.0 && elapsed > Duration::from_secs(5) {
                                log.push(format!("Note: high CPU usage ({cpu:.0}%)"));
                            }
                        }
                    }
                }
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !stderr.is_empty() {
            log.push(format!("Stderr: {}", String::from_utf8_lossy(&stderr).trim_end()));
        }

        if !status.success() {
            log.push(format!("Runner exited with {status}"));
            return self.fail(
                log,
                SandboxErrorKind::RuntimeError,
                format!(
                    "sandbox process exited with {status}: {}",
                    String::from_utf8_lossy(&stderr).trim_end()
                ),
                None,
            );
        }

        let response: ExecutionResponse = match serde_json::from_slice(&stdout) {
            Ok(response) => response,
            Err(error) => {
                log.push(format!("ERROR: failed to parse runner output: {error}"));
                log.push(format!("Raw output length: {} bytes", stdout.len()));
                return self.fail(
                    log,
                    SandboxErrorKind::DeserializationFailure,
                    format!("failed to parse sandbox output: {error}"),
                    None,
                );
            }
        };

        if !response.printed.is_empty() {
            for line in response.printed.lines() {
                log.push(format!("Output: {line}"));
            }
        }

        if response.success {
            let Some(dataframe) = response.dataframe else {
                log.push("ERROR: success envelope missing its frame".to_owned());
                return self.fail(
                    log,
                    SandboxErrorKind::DeserializationFailure,
                    "success envelope missing its frame",
                    None,
                );
            };
            let row_count = response.row_count.unwrap_or_else(|| dataframe.height());
            let columns = response.columns.unwrap_or_default();
            log.push(format!("SUCCESS: transformed {row_count} rows"));
            log.push(format!("Output columns: {columns:?}"));
            debug!(job_id = self.job_id, rows = row_count, "sandbox execution succeeded");
            ExecutionReport {
                outcome: Ok(SandboxSuccess {
                    dataframe,
                    row_count,
                    columns,
                }),
                log: log.finish(),
            }
        } else {
            let error_type = response.error_type.unwrap_or_else(|| "Error".to_owned());
            let message = response.error.unwrap_or_else(|| "unknown error".to_owned());
            log.push(format!("EXECUTION FAILED: {error_type}: {message}"));
            if let Some(traceback) = &response.traceback {
                log.push(format!("Traceback:\n{traceback}"));
            }
            let kind = if error_type == "BadReturnType" {
                SandboxErrorKind::BadReturnType
            } else {
                SandboxErrorKind::RuntimeError
            };
            self.fail(
                log,
                kind,
                format!("{error_type}: {message}"),
                response.traceback,
            )
        }
    }

    fn fail(
        &self,
        mut log: ExecutionLog,
        kind: SandboxErrorKind,
        message: impl Into<String>,
        traceback: Option<String>,
    ) -> ExecutionReport {
        let message = message.into();
        log.push(format!("Sandbox failure ({kind}): {message}"));
        warn!(job_id = self.job_id, %kind, %message, "sandbox execution failed");
        ExecutionReport {
            outcome: Err(SandboxFailure {
                kind,
                message,
                traceback,
            }),
            log: log.finish(),
        }
    }
}

/// Kill the runner and any processes it spawned. The runner itself
/// never forks, so the sweep is a defense against user code that finds
/// a way to.
async fn kill_process_tree(pid: Option<u32>, child: &mut tokio::process::Child) {
    if let Some(pid) = pid {
        let root = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut doomed = vec![root];
        let mut index = 0;
        while index < doomed.len() {
            let parent = doomed[index];
            for (candidate, process) in system.processes() {
                if process.parent() == Some(parent) && !doomed.contains(candidate) {
                    doomed.push(*candidate);
                }
            }
            index += 1;
        }

        // children first, the root last
        for target in doomed.iter().rev() {
            if let Some(process) = system.process(*target) {
                process.kill();
            }
        }
    }

    child.start_kill().ok();
    child.wait().await.ok();
}

/// Locate the runner binary: an explicit override, then next to the
/// current executable, then one directory up (where cargo places
/// binaries relative to test executables).
fn default_runner_path() -> PathBuf {
    if let Ok(path) = std::env::var("TRANSFORM_RUNNER_BIN") {
        return PathBuf::from(path);
    }

    let exe = std::env::current_exe().unwrap_or_default();
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    let candidate = dir.join(RUNNER_BIN);
    if candidate.exists() {
        return candidate;
    }
    if let Some(parent) = dir.parent() {
        let candidate = parent.join(RUNNER_BIN);
        if candidate.exists() {
            return candidate;
        }
    }
    candidate
}

struct ExecutionLog {
    lines: Vec<String>,
}

impl ExecutionLog {
    fn new() -> Self {
        Self { lines: Vec::new() }
    }

    fn push(&mut self, message: String) {
        let timestamp = Local::now().format("%H:%M:%S%.3f");
        self.lines.push(format!("[{timestamp}] {message}"));
    }

    fn finish(self) -> String {
        self.lines.join("\n")
    }
}
