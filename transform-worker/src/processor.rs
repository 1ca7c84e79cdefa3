//! Per-job orchestration: load, transform, write, transition.
//!
//! One processor call runs one dispatched job to a terminal state.
//! Small sources go through the sandbox in one piece; anything above
//! the chunk size streams through LIMIT/OFFSET slices, each one
//! transformed by a freshly spawned sandbox process and appended to
//! the destination. Cancellation is observed between chunks and
//! between phases, never mid-sandbox.

use chrono::Local;
use tracing::{error, info, warn};

use transform_common::datastore::{DataStore, WriteMode};
use transform_common::queue::{FailureKind, QueueManager};
use transform_common::script::Script;
use transform_sandbox::{SandboxErrorKind, SandboxExecutor, SandboxFailure, SandboxLimits};

use crate::error::WorkerError;

pub struct JobProcessor {
    queue: QueueManager,
    store: DataStore,
    limits: SandboxLimits,
    chunk_size: usize,
}

impl JobProcessor {
    pub fn new(
        queue: QueueManager,
        store: DataStore,
        limits: SandboxLimits,
        chunk_size: usize,
    ) -> Self {
        Self {
            queue,
            store,
            limits,
            chunk_size,
        }
    }

    /// Process a dispatched job to a terminal state.
    ///
    /// Returns Err only for failures the processor could not record
    /// itself (the job row is missing, or the queue is unreachable);
    /// the supervisor settles those.
    pub async fn process(&self, job_id: i64) -> Result<(), WorkerError> {
        info!(job_id, "processing job");
        let started = tokio::time::Instant::now();
        let mut log = JobLog::new();

        let result = self.run(job_id, &mut log).await;
        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!("transform_job_duration_seconds").record(elapsed);

        result
    }

    async fn run(&self, job_id: i64, log: &mut JobLog) -> Result<(), WorkerError> {
        let Some(job) = self.queue.job(job_id).await? else {
            return Err(WorkerError::JobNotFound(job_id));
        };

        let script = match job.script_id {
            Some(script_id) => Script::fetch(self.queue.pool(), script_id).await?,
            None => None,
        };
        let Some(script) = script else {
            log.push("Script not found".to_owned());
            return self
                .fail(job_id, "Script not found", log, FailureKind::Failed)
                .await;
        };

        // Snapshot everything the run needs; the row is not held open.
        let source_table = job.source_table;
        let destination_table = job.destination_table;
        let code = script.code_text;

        log.push("Job started".to_owned());
        log.push(format!("Source: {source_table}"));
        log.push(format!("Destination: {destination_table}"));

        let total_rows = match self.store.row_count(&source_table).await {
            Ok(count) => count,
            Err(store_error) => {
                log.push(format!("ERROR: {store_error}"));
                return self
                    .fail(job_id, &store_error.to_string(), log, FailureKind::Failed)
                    .await;
            }
        };
        log.push(format!("Source table has {total_rows} rows"));

        if total_rows as usize > self.chunk_size {
            self.process_chunked(job_id, &code, &source_table, &destination_table, total_rows, log)
                .await
        } else {
            self.process_full(job_id, &code, &source_table, &destination_table, log)
                .await
        }
    }

    /// Full-table path for sources at or below the chunk size.
    async fn process_full(
        &self,
        job_id: i64,
        code: &str,
        source_table: &str,
        destination_table: &str,
        log: &mut JobLog,
    ) -> Result<(), WorkerError> {
        log.push("Loading table data...".to_owned());
        let df = match self.store.read_table(source_table).await {
            Ok(df) => df,
            Err(store_error) => {
                log.push(format!("ERROR: {store_error}"));
                return self
                    .fail(job_id, &store_error.to_string(), log, FailureKind::Failed)
                    .await;
            }
        };
        log.push(format!("Loaded {} rows", df.height()));

        log.push("Executing transformation...".to_owned());
        let executor = SandboxExecutor::new(job_id, self.limits);
        let report = executor.execute(code, df).await;
        log.push_block(&report.log);
        metrics::counter!("transform_sandbox_executions_total").increment(1);

        let success = match report.outcome {
            Ok(success) => success,
            Err(failure) => {
                let kind = failure_kind(&failure);
                return self
                    .fail(job_id, &format!("Transformation failed: {}", failure.message), log, kind)
                    .await;
            }
        };

        if self.queue.is_cancelled(job_id).await? {
            log.push("Job cancelled by user".to_owned());
            return self
                .fail(job_id, "Job cancelled by user", log, FailureKind::Killed)
                .await;
        }

        log.push(format!("Writing to {destination_table}..."));
        let rows_written = match self
            .store
            .write_table(&success.dataframe, destination_table, WriteMode::Replace)
            .await
        {
            Ok(rows) => rows,
            Err(store_error) => {
                log.push(format!("ERROR: {store_error}"));
                return self
                    .fail(job_id, &store_error.to_string(), log, FailureKind::Failed)
                    .await;
            }
        };
        log.push(format!("Wrote {rows_written} rows"));

        self.complete(job_id, rows_written as i64, log).await
    }

    /// Chunked path: each slice is transformed by a fresh sandbox
    /// process; there is no shared state across chunks, so transforms
    /// must be pure over their input.
    async fn process_chunked(
        &self,
        job_id: i64,
        code: &str,
        source_table: &str,
        destination_table: &str,
        total_rows: i64,
        log: &mut JobLog,
    ) -> Result<(), WorkerError> {
        log.push(format!("Processing in chunks of {} rows", self.chunk_size));

        let mut offset = 0i64;
        let mut chunk_num = 0u64;
        let mut rows_processed = 0i64;
        let mut first_chunk = true;

        while offset < total_rows {
            chunk_num += 1;

            if self.queue.is_cancelled(job_id).await? {
                log.push("Job cancelled by user".to_owned());
                return self
                    .fail(job_id, "Job cancelled by user", log, FailureKind::Killed)
                    .await;
            }

            let upper = (offset + self.chunk_size as i64).min(total_rows);
            log.push(format!(
                "Processing chunk {chunk_num} (rows {offset}-{upper})"
            ));

            let chunk = match self
                .store
                .read_chunk(source_table, self.chunk_size as i64, offset)
                .await
            {
                Ok(chunk) => chunk,
                Err(store_error) => {
                    log.push(format!("ERROR: {store_error}"));
                    return self
                        .fail(job_id, &store_error.to_string(), log, FailureKind::Failed)
                        .await;
                }
            };
            if chunk.height() == 0 {
                break;
            }
            log.push(format!("Loaded {} rows", chunk.height()));

            let executor = SandboxExecutor::new(job_id, self.limits);
            let report = executor.execute(code, chunk).await;
            log.push_block(&report.log);
            metrics::counter!("transform_sandbox_executions_total").increment(1);

            let success = match report.outcome {
                Ok(success) => success,
                Err(failure) => {
                    let kind = failure_kind(&failure);
                    return self
                        .fail(
                            job_id,
                            &format!(
                                "Transformation failed on chunk {chunk_num}: {}",
                                failure.message
                            ),
                            log,
                            kind,
                        )
                        .await;
                }
            };

            let mode = if first_chunk {
                WriteMode::Replace
            } else {
                WriteMode::Append
            };
            let rows_written = match self
                .store
                .write_table(&success.dataframe, destination_table, mode)
                .await
            {
                Ok(rows) => rows,
                Err(store_error) => {
                    log.push(format!("ERROR: {store_error}"));
                    return self
                        .fail(job_id, &store_error.to_string(), log, FailureKind::Failed)
                        .await;
                }
            };

            rows_processed += rows_written as i64;
            first_chunk = false;
            offset += self.chunk_size as i64;

            self.queue
                .update_progress(job_id, rows_processed, &log.text())
                .await?;
            metrics::counter!("transform_rows_written_total").increment(rows_written);

            log.push(format!(
                "Chunk {chunk_num} complete: {rows_written} rows written"
            ));
        }

        log.push(format!(
            "All chunks processed: {rows_processed} total rows"
        ));
        self.complete(job_id, rows_processed, log).await
    }

    async fn complete(&self, job_id: i64, rows: i64, log: &JobLog) -> Result<(), WorkerError> {
        self.queue.mark_completed(job_id, rows, &log.text()).await?;
        metrics::counter!("transform_jobs_completed_total").increment(1);
        info!(job_id, rows, "job completed");
        Ok(())
    }

    async fn fail(
        &self,
        job_id: i64,
        error_message: &str,
        log: &JobLog,
        kind: FailureKind,
    ) -> Result<(), WorkerError> {
        let updated = self
            .queue
            .mark_failed(job_id, error_message, &log.text(), kind)
            .await?;
        if !updated {
            // the user's cancel already moved the row to killed
            warn!(job_id, "terminal transition skipped, job already settled");
        }
        let labels = [("kind", kind_label(kind))];
        metrics::counter!("transform_jobs_failed_total", &labels).increment(1);
        error!(job_id, error_message, "job failed");
        Ok(())
    }
}

fn failure_kind(failure: &SandboxFailure) -> FailureKind {
    match failure.kind {
        SandboxErrorKind::Timeout => FailureKind::Timeout,
        _ => FailureKind::Failed,
    }
}

fn kind_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Failed => "failed",
        FailureKind::Timeout => "timeout",
        FailureKind::Killed => "killed",
    }
}

/// Append-only, timestamped job log persisted on every transition.
pub struct JobLog {
    lines: Vec<String>,
}

impl JobLog {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn push(&mut self, message: String) {
        let timestamp = Local::now().format("%H:%M:%S%.3f");
        self.lines.push(format!("[{timestamp}] {message}"));
    }

    /// Append already-timestamped lines, e.g. a sandbox report.
    pub fn push_block(&mut self, block: &str) {
        if !block.is_empty() {
            self.lines.push(block.to_owned());
        }
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl Default for JobLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;
    use sqlx::PgPool;
    use transform_common::queue::{JobStatus, NewJob};

    const CHUNK_SIZE: usize = 2;

    fn processor(pool: PgPool, chunk_size: usize) -> JobProcessor {
        let queue = QueueManager::new(pool.clone());
        let store = DataStore::new(pool, 1_000_000, chunk_size);
        JobProcessor::new(queue, store, SandboxLimits::default(), chunk_size)
    }

    async fn seed_user(pool: &PgPool) -> i64 {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO users (username, password_hash) VALUES ('tester', 'x') RETURNING id",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        id
    }

    async fn seed_script(pool: &PgPool, user_id: i64, code: &str) -> i64 {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO scripts (user_id, name, code_text) VALUES ($1, 'test', $2) RETURNING id",
        )
        .bind(user_id)
        .bind(code)
        .fetch_one(pool)
        .await
        .unwrap();
        id
    }

    async fn seed_sales(pool: &PgPool, rows: usize) {
        let store = DataStore::new(pool.clone(), 1_000_000, 50_000);
        let values: Vec<i64> = (1..=rows as i64).collect();
        let doubled: Vec<i64> = values.iter().map(|v| v * 2).collect();
        let df = DataFrame::new(vec![
            Series::new("price".into(), values).into_column(),
            Series::new("qty".into(), doubled).into_column(),
        ])
        .unwrap();
        store
            .write_table(&df, "sales", WriteMode::Replace)
            .await
            .unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_missing_script_marks_job_failed(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool.clone());
        let job_id = queue
            .enqueue(NewJob {
                user_id,
                script_id: None,
                source_table: "sales".to_owned(),
                destination_table: "sales_out".to_owned(),
            })
            .await
            .unwrap();
        queue.mark_running(job_id).await.unwrap();

        processor(pool.clone(), CHUNK_SIZE)
            .process(job_id)
            .await
            .unwrap();

        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("Script not found"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_blocked_import_marks_job_failed_without_destination(pool: PgPool) {
        seed_sales(&pool, 3).await;
        let user_id = seed_user(&pool).await;
        let script_id = seed_script(&pool, user_id, "import os\nreturn df\n").await;
        let queue = QueueManager::new(pool.clone());
        let job_id = queue
            .enqueue(NewJob {
                user_id,
                script_id: Some(script_id),
                source_table: "sales".to_owned(),
                destination_table: "sales_out".to_owned(),
            })
            .await
            .unwrap();
        queue.mark_running(job_id).await.unwrap();

        processor(pool.clone(), 50_000)
            .process(job_id)
            .await
            .unwrap();

        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("not allowed"));

        let store = DataStore::new(pool, 1_000_000, 50_000);
        assert!(!store.table_exists("sales_out").await.unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_full_table_path_end_to_end(pool: PgPool) {
        seed_sales(&pool, 3).await;
        let user_id = seed_user(&pool).await;
        let script_id = seed_script(
            &pool,
            user_id,
            "df[\"total\"] = df[\"price\"] * df[\"qty\"]\nreturn df\n",
        )
        .await;
        let queue = QueueManager::new(pool.clone());
        let job_id = queue
            .enqueue(NewJob {
                user_id,
                script_id: Some(script_id),
                source_table: "sales".to_owned(),
                destination_table: "sales_out".to_owned(),
            })
            .await
            .unwrap();
        queue.mark_running(job_id).await.unwrap();

        processor(pool.clone(), 50_000)
            .process(job_id)
            .await
            .unwrap();

        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_processed, 3);
        assert!(job.completed_at.is_some());
        assert!(job.logs.contains("Wrote 3 rows"));

        let store = DataStore::new(pool, 1_000_000, 50_000);
        assert_eq!(store.row_count("sales_out").await.unwrap(), 3);
        let out = store.read_table("sales_out").await.unwrap();
        assert!(out.column("total").is_ok());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_chunked_path_appends_all_chunks(pool: PgPool) {
        // 5 rows with a chunk size of 2: replace, append, append
        seed_sales(&pool, 5).await;
        let user_id = seed_user(&pool).await;
        let script_id = seed_script(&pool, user_id, "return df\n").await;
        let queue = QueueManager::new(pool.clone());
        let job_id = queue
            .enqueue(NewJob {
                user_id,
                script_id: Some(script_id),
                source_table: "sales".to_owned(),
                destination_table: "sales_out".to_owned(),
            })
            .await
            .unwrap();
        queue.mark_running(job_id).await.unwrap();

        processor(pool.clone(), CHUNK_SIZE)
            .process(job_id)
            .await
            .unwrap();

        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_processed, 5);
        assert!(job.logs.contains("Processing chunk 3"));

        let store = DataStore::new(pool, 1_000_000, CHUNK_SIZE);
        assert_eq!(store.row_count("sales_out").await.unwrap(), 5);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_row_count_equal_to_chunk_size_uses_full_path(pool: PgPool) {
        seed_sales(&pool, 2).await;
        let user_id = seed_user(&pool).await;
        let script_id = seed_script(&pool, user_id, "return df\n").await;
        let queue = QueueManager::new(pool.clone());
        let job_id = queue
            .enqueue(NewJob {
                user_id,
                script_id: Some(script_id),
                source_table: "sales".to_owned(),
                destination_table: "sales_out".to_owned(),
            })
            .await
            .unwrap();
        queue.mark_running(job_id).await.unwrap();

        processor(pool.clone(), CHUNK_SIZE)
            .process(job_id)
            .await
            .unwrap();

        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_processed, 2);
        // exactly at the threshold there is no chunk loop
        assert!(!job.logs.contains("Processing chunk"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_cancelled_job_stops_at_chunk_boundary(pool: PgPool) {
        seed_sales(&pool, 5).await;
        let user_id = seed_user(&pool).await;
        let script_id = seed_script(&pool, user_id, "return df\n").await;
        let queue = QueueManager::new(pool.clone());
        let job_id = queue
            .enqueue(NewJob {
                user_id,
                script_id: Some(script_id),
                source_table: "sales".to_owned(),
                destination_table: "sales_out".to_owned(),
            })
            .await
            .unwrap();
        queue.mark_running(job_id).await.unwrap();

        // the user cancels before the first boundary check
        sqlx::query("UPDATE jobs SET status = 'killed'::job_status WHERE id = $1")
            .bind(job_id)
            .execute(&pool)
            .await
            .unwrap();

        processor(pool.clone(), CHUNK_SIZE)
            .process(job_id)
            .await
            .unwrap();

        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Killed);

        let store = DataStore::new(pool, 1_000_000, CHUNK_SIZE);
        assert!(!store.table_exists("sales_out").await.unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_bad_return_type_reports_frame_error(pool: PgPool) {
        seed_sales(&pool, 3).await;
        let user_id = seed_user(&pool).await;
        let script_id = seed_script(&pool, user_id, "return \"hello\"\n").await;
        let job_id = {
            let queue = QueueManager::new(pool.clone());
            let id = queue
                .enqueue(NewJob {
                    user_id,
                    script_id: Some(script_id),
                    source_table: "sales".to_owned(),
                    destination_table: "sales_out".to_owned(),
                })
                .await
                .unwrap();
            queue.mark_running(id).await.unwrap();
            id
        };

        processor(pool.clone(), 50_000)
            .process(job_id)
            .await
            .unwrap();

        let queue = QueueManager::new(pool);
        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("DataFrame"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_missing_job_is_an_error_for_the_supervisor(pool: PgPool) {
        let result = processor(pool, CHUNK_SIZE).process(424242).await;
        assert!(matches!(result, Err(WorkerError::JobNotFound(424242))));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_progress_is_monotonic_across_chunks(pool: PgPool) {
        seed_sales(&pool, 6).await;
        let user_id = seed_user(&pool).await;
        let script_id = seed_script(&pool, user_id, "return df\n").await;
        let queue = QueueManager::new(pool.clone());
        let job_id = queue
            .enqueue(NewJob {
                user_id,
                script_id: Some(script_id),
                source_table: "sales".to_owned(),
                destination_table: "sales_out".to_owned(),
            })
            .await
            .unwrap();
        queue.mark_running(job_id).await.unwrap();

        processor(pool.clone(), CHUNK_SIZE)
            .process(job_id)
            .await
            .unwrap();

        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_processed, 6);
    }
}
