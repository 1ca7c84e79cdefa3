//! # Job queue
//!
//! Durable job lifecycle state backed by the `jobs` PostgreSQL table.
//!
//! Every transition is a single SQL statement, so it is atomic under
//! the database's default isolation and safe under concurrent
//! supervisors. Dispatch relies on `mark_running`'s WHERE-pending
//! predicate rather than row locks: two supervisors may fetch the same
//! pending row, but only one CAS succeeds.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatus(String),
    #[error("{0} is not a valid OrphanPolicy")]
    ParseOrphanPolicy(String),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Lifecycle state of a job.
///
/// Transitions run only along pending → running → {completed, failed,
/// timeout, killed}, with the cancellation edges pending → killed and
/// running → killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue to be picked up by the supervisor.
    Pending,
    /// Dispatched to an executor and currently being processed.
    Running,
    /// Finished successfully; results live in the destination table.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Killed by the resource monitor for exceeding the wall clock.
    Timeout,
    /// Cancelled by the owning user.
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout | JobStatus::Killed
        )
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "timeout" => Ok(JobStatus::Timeout),
            "killed" => Ok(JobStatus::Killed),
            invalid => Err(QueueError::ParseJobStatus(invalid.to_owned())),
        }
    }
}

/// Terminal failure classification a processor can assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Failed,
    Timeout,
    Killed,
}

impl FailureKind {
    pub fn status(self) -> JobStatus {
        match self {
            FailureKind::Failed => JobStatus::Failed,
            FailureKind::Timeout => JobStatus::Timeout,
            FailureKind::Killed => JobStatus::Killed,
        }
    }
}

/// What to do with jobs found `running` at supervisor startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Mark them failed with an explanatory message.
    Fail,
    /// Reset them to pending for another attempt.
    Requeue,
}

impl FromStr for OrphanPolicy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(OrphanPolicy::Fail),
            "requeue" => Ok(OrphanPolicy::Requeue),
            invalid => Err(QueueError::ParseOrphanPolicy(invalid.to_owned())),
        }
    }
}

/// A queued transformation request.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    pub script_id: Option<i64>,
    pub source_table: String,
    pub destination_table: String,
    pub status: JobStatus,
    pub logs: String,
    pub error_message: Option<String>,
    pub rows_processed: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A job to be enqueued. Ownership is taken on enqueue so a specific
/// NewJob is only ever inserted once.
pub struct NewJob {
    pub user_id: i64,
    pub script_id: Option<i64>,
    pub source_table: String,
    pub destination_table: String,
}

#[derive(Clone)]
pub struct QueueManager {
    pool: PgPool,
}

impl QueueManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool against `url`.
    pub async fn connect(url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| QueueError::Connection { error })?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a pending job, returning its id.
    pub async fn enqueue(&self, job: NewJob) -> QueueResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
INSERT INTO jobs (user_id, script_id, source_table, destination_table, status)
VALUES ($1, $2, $3, $4, 'pending'::job_status)
RETURNING id
            "#,
        )
        .bind(job.user_id)
        .bind(job.script_id)
        .bind(&job.source_table)
        .bind(&job.destination_table)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| QueueError::Query {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(id)
    }

    /// Pending jobs in submission order. Read-only; claiming a job is
    /// a separate `mark_running` transition.
    pub async fn fetch_pending(&self, limit: i64) -> QueueResult<Vec<Job>> {
        sqlx::query_as(
            r#"
SELECT * FROM jobs
WHERE status = 'pending'::job_status
ORDER BY created_at ASC
LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| QueueError::Query {
            command: "SELECT".to_owned(),
            error,
        })
    }

    pub async fn job(&self, id: i64) -> QueueResult<Option<Job>> {
        sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Claim a pending job. Returns false if someone else claimed it
    /// first or the user cancelled it before dispatch.
    pub async fn mark_running(&self, id: i64) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET status = 'running'::job_status, started_at = NOW()
WHERE id = $1 AND status = 'pending'::job_status
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_completed(&self, id: i64, rows: i64, logs: &str) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET status = 'completed'::job_status,
    rows_processed = $2,
    logs = $3,
    completed_at = NOW()
WHERE id = $1 AND status = 'running'::job_status
            "#,
        )
        .bind(id)
        .bind(rows)
        .bind(logs)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Transition a running job to one of the failure states.
    pub async fn mark_failed(
        &self,
        id: i64,
        error_message: &str,
        logs: &str,
        kind: FailureKind,
    ) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET status = $2,
    error_message = $3,
    logs = $4,
    completed_at = NOW()
WHERE id = $1 AND status = 'running'::job_status
            "#,
        )
        .bind(id)
        .bind(kind.status())
        .bind(error_message)
        .bind(logs)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Non-terminal progress update used between chunks.
    pub async fn update_progress(&self, id: i64, rows: i64, logs: &str) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET rows_processed = $2, logs = $3
WHERE id = $1 AND status = 'running'::job_status
            "#,
        )
        .bind(id)
        .bind(rows)
        .bind(logs)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// True iff the user cancelled the job. Polled between chunks and
    /// between long-running phases.
    pub async fn is_cancelled(&self, id: i64) -> QueueResult<bool> {
        let status: Option<(JobStatus,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(matches!(status, Some((JobStatus::Killed,))))
    }

    /// Resolve jobs left `running` by a dead supervisor.
    pub async fn recover_orphaned(&self, policy: OrphanPolicy) -> QueueResult<u64> {
        let query = match policy {
            OrphanPolicy::Fail => {
                r#"
UPDATE jobs
SET status = 'failed'::job_status,
    error_message = 'orphaned at supervisor startup',
    completed_at = NOW()
WHERE status = 'running'::job_status
                "#
            }
            OrphanPolicy::Requeue => {
                r#"
UPDATE jobs
SET status = 'pending'::job_status, started_at = NULL
WHERE status = 'running'::job_status
                "#
            }
        };

        let result =
            sqlx::query(query)
                .execute(&self.pool)
                .await
                .map_err(|error| QueueError::Query {
                    command: "UPDATE".to_owned(),
                    error,
                })?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    async fn seed_user(pool: &PgPool) -> i64 {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO users (username, password_hash) VALUES ('tester', 'x') RETURNING id",
        )
        .fetch_one(pool)
        .await
        .expect("failed to insert test user");
        id
    }

    fn new_job(user_id: i64) -> NewJob {
        NewJob {
            user_id,
            script_id: None,
            source_table: "sales".to_owned(),
            destination_table: "sales_out".to_owned(),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_enqueue_then_fetch_in_submission_order(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);

        let first = queue.enqueue(new_job(user_id)).await.unwrap();
        let second = queue.enqueue(new_job(user_id)).await.unwrap();

        let pending = queue.fetch_pending(10).await.unwrap();
        assert_eq!(
            pending.iter().map(|job| job.id).collect::<Vec<_>>(),
            vec![first, second]
        );
        assert!(pending.iter().all(|job| job.status == JobStatus::Pending));
        assert!(pending.iter().all(|job| job.started_at.is_none()));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_mark_running_claims_exactly_once(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);
        let id = queue.enqueue(new_job(user_id)).await.unwrap();

        assert!(queue.mark_running(id).await.unwrap());
        // A second supervisor racing on the same row loses the CAS.
        assert!(!queue.mark_running(id).await.unwrap());

        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_completed_job_carries_rows_and_logs(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);
        let id = queue.enqueue(new_job(user_id)).await.unwrap();

        queue.mark_running(id).await.unwrap();
        assert!(queue.mark_completed(id, 42, "all done").await.unwrap());

        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_processed, 42);
        assert_eq!(job.logs, "all done");
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
        assert!(job.started_at.unwrap() >= job.created_at);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_mark_failed_applies_requested_kind(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);

        for (kind, expected) in [
            (FailureKind::Failed, JobStatus::Failed),
            (FailureKind::Timeout, JobStatus::Timeout),
            (FailureKind::Killed, JobStatus::Killed),
        ] {
            let id = queue.enqueue(new_job(user_id)).await.unwrap();
            queue.mark_running(id).await.unwrap();
            assert!(queue.mark_failed(id, "boom", "log text", kind).await.unwrap());

            let job = queue.job(id).await.unwrap().unwrap();
            assert_eq!(job.status, expected);
            assert_eq!(job.error_message.as_deref(), Some("boom"));
            assert!(job.completed_at.is_some());
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_terminal_jobs_reject_further_transitions(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);
        let id = queue.enqueue(new_job(user_id)).await.unwrap();

        queue.mark_running(id).await.unwrap();
        queue
            .mark_failed(id, "cancelled", "", FailureKind::Killed)
            .await
            .unwrap();

        // A processor finishing late must not resurrect a killed job.
        assert!(!queue.mark_completed(id, 10, "late").await.unwrap());
        assert!(!queue.update_progress(id, 10, "late").await.unwrap());

        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Killed);
        assert_eq!(job.rows_processed, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_is_cancelled_observes_killed_status(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);
        let id = queue.enqueue(new_job(user_id)).await.unwrap();

        queue.mark_running(id).await.unwrap();
        assert!(!queue.is_cancelled(id).await.unwrap());

        sqlx::query("UPDATE jobs SET status = 'killed'::job_status WHERE id = $1")
            .bind(id)
            .execute(queue.pool())
            .await
            .unwrap();
        assert!(queue.is_cancelled(id).await.unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_update_progress_accumulates(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);
        let id = queue.enqueue(new_job(user_id)).await.unwrap();

        queue.mark_running(id).await.unwrap();
        queue.update_progress(id, 50_000, "chunk 1").await.unwrap();
        let first = queue.job(id).await.unwrap().unwrap().rows_processed;

        queue.update_progress(id, 100_000, "chunk 2").await.unwrap();
        let second = queue.job(id).await.unwrap().unwrap().rows_processed;

        assert_eq!(first, 50_000);
        assert_eq!(second, 100_000);
        assert!(second >= first);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_recover_orphaned_fail_policy(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);
        let id = queue.enqueue(new_job(user_id)).await.unwrap();
        queue.mark_running(id).await.unwrap();

        let recovered = queue.recover_orphaned(OrphanPolicy::Fail).await.unwrap();
        assert_eq!(recovered, 1);

        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("orphaned at supervisor startup")
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_recover_orphaned_requeue_policy(pool: PgPool) {
        let user_id = seed_user(&pool).await;
        let queue = QueueManager::new(pool);
        let id = queue.enqueue(new_job(user_id)).await.unwrap();
        queue.mark_running(id).await.unwrap();

        let recovered = queue.recover_orphaned(OrphanPolicy::Requeue).await.unwrap();
        assert_eq!(recovered, 1);

        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        // The requeued job is claimable again.
        assert!(queue.mark_running(id).await.unwrap());
    }
}
