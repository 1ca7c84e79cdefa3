//! The outer scheduling loop.
//!
//! Each iteration reaps finished executors, tops the active set up to
//! the concurrency cap with pending jobs (oldest first), and sleeps
//! the poll interval. Claiming a job is a compare-and-set on the queue
//! row, so two supervisors polling the same table never dispatch the
//! same job: the loser of the race just skips it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use transform_common::health::Liveness;
use transform_common::queue::{FailureKind, OrphanPolicy, QueueManager};

use crate::processor::JobProcessor;

pub struct WorkerSupervisor {
    queue: QueueManager,
    processor: Arc<JobProcessor>,
    poll_interval: Duration,
    max_concurrent_jobs: usize,
    orphan_policy: OrphanPolicy,
    liveness: Liveness,
    active: HashMap<i64, JoinHandle<()>>,
}

impl WorkerSupervisor {
    pub fn new(
        queue: QueueManager,
        processor: JobProcessor,
        poll_interval: Duration,
        max_concurrent_jobs: usize,
        orphan_policy: OrphanPolicy,
        liveness: Liveness,
    ) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            poll_interval,
            max_concurrent_jobs,
            orphan_policy,
            liveness,
            active: HashMap::new(),
        }
    }

    /// Run until `shutdown` resolves, then stop polling and drain the
    /// active executors.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!(
            poll_interval = ?self.poll_interval,
            max_concurrent_jobs = self.max_concurrent_jobs,
            "supervisor starting"
        );

        match self.queue.recover_orphaned(self.orphan_policy).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, policy = ?self.orphan_policy, "settled orphaned jobs"),
            Err(queue_error) => error!(%queue_error, "failed to settle orphaned jobs"),
        }

        tokio::pin!(shutdown);
        loop {
            self.reap().await;
            self.liveness.report_healthy();
            metrics::gauge!("transform_worker_active_jobs").set(self.active.len() as f64);

            let free = self.max_concurrent_jobs.saturating_sub(self.active.len());
            if free > 0 {
                if let Err(queue_error) = self.dispatch_pending(free).await {
                    error!(%queue_error, "poll failed, backing off until the next interval");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = &mut shutdown => break,
            }
        }

        info!(active = self.active.len(), "shutting down, draining active jobs");
        for (job_id, handle) in self.active.drain() {
            if let Err(join_error) = handle.await {
                error!(job_id, %join_error, "job task failed during drain");
            }
        }
        info!("supervisor stopped");
    }

    /// Fetch up to `free` pending jobs and dispatch each one whose
    /// claim we win.
    async fn dispatch_pending(&mut self, free: usize) -> Result<(), transform_common::queue::QueueError> {
        let pending = self.queue.fetch_pending(free as i64).await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "found pending jobs");

        for job in pending {
            if self.active.len() >= self.max_concurrent_jobs {
                break;
            }

            // the CAS fails if another supervisor claimed the row or
            // the user cancelled it before dispatch
            if !self.queue.mark_running(job.id).await? {
                debug!(job_id = job.id, "skipping job, claim lost");
                continue;
            }

            metrics::counter!("transform_jobs_dispatched_total").increment(1);
            info!(job_id = job.id, "dispatched job");

            let processor = Arc::clone(&self.processor);
            let queue = self.queue.clone();
            let job_id = job.id;
            let handle = tokio::spawn(async move {
                if let Err(worker_error) = processor.process(job_id).await {
                    // the processor could not settle the job itself;
                    // settle it here so nothing stays running forever
                    error!(job_id, %worker_error, "job executor failed");
                    if let Err(queue_error) = queue
                        .mark_failed(job_id, &worker_error.to_string(), "", FailureKind::Failed)
                        .await
                    {
                        error!(job_id, %queue_error, "failed to settle failed job");
                    }
                }
            });
            self.active.insert(job_id, handle);
        }

        Ok(())
    }

    /// Await every finished executor so panics surface, and settle any
    /// job whose task died without reaching a terminal transition.
    async fn reap(&mut self) {
        let finished: Vec<i64> = self
            .active
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in finished {
            let Some(handle) = self.active.remove(&job_id) else {
                continue;
            };
            if let Err(join_error) = handle.await {
                warn!(job_id, %join_error, "job task panicked, marking the job failed");
                if let Err(queue_error) = self
                    .queue
                    .mark_failed(
                        job_id,
                        "internal error: job executor panicked",
                        "",
                        FailureKind::Failed,
                    )
                    .await
                {
                    error!(job_id, %queue_error, "failed to settle panicked job");
                }
            } else {
                debug!(job_id, "reaped finished executor");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;
    use sqlx::PgPool;
    use transform_common::datastore::{DataStore, WriteMode};
    use transform_common::queue::{JobStatus, NewJob};
    use transform_sandbox::SandboxLimits;

    async fn seed_job(pool: &PgPool, code: &str) -> i64 {
        let (user_id,): (i64,) = sqlx::query_as(
            "INSERT INTO users (username, password_hash) VALUES ('tester', 'x') RETURNING id",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        let (script_id,): (i64,) = sqlx::query_as(
            "INSERT INTO scripts (user_id, name, code_text) VALUES ($1, 'test', $2) RETURNING id",
        )
        .bind(user_id)
        .bind(code)
        .fetch_one(pool)
        .await
        .unwrap();

        let store = DataStore::new(pool.clone(), 1_000_000, 50_000);
        let df = DataFrame::new(vec![
            Series::new("price".into(), &[10i64, 20, 30]).into_column(),
            Series::new("qty".into(), &[2i64, 3, 4]).into_column(),
        ])
        .unwrap();
        store
            .write_table(&df, "sales", WriteMode::Replace)
            .await
            .unwrap();

        QueueManager::new(pool.clone())
            .enqueue(NewJob {
                user_id,
                script_id: Some(script_id),
                source_table: "sales".to_owned(),
                destination_table: "sales_out".to_owned(),
            })
            .await
            .unwrap()
    }

    fn supervisor(pool: PgPool) -> WorkerSupervisor {
        let queue = QueueManager::new(pool.clone());
        let store = DataStore::new(pool, 1_000_000, 50_000);
        let processor = JobProcessor::new(
            queue.clone(),
            store,
            SandboxLimits::default(),
            50_000,
        );
        WorkerSupervisor::new(
            queue,
            processor,
            Duration::from_millis(50),
            2,
            OrphanPolicy::Fail,
            Liveness::new(chrono::Duration::seconds(30)),
        )
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_supervisor_runs_a_job_to_completion(pool: PgPool) {
        let job_id = seed_job(&pool, "df[\"total\"] = df[\"price\"] * df[\"qty\"]\nreturn df\n")
            .await;

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(supervisor(pool.clone()).run(async {
            let _ = stop_rx.await;
        }));

        let queue = QueueManager::new(pool.clone());
        let mut status = JobStatus::Pending;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            status = queue.job(job_id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
        }

        let _ = stop_tx.send(());
        handle.await.unwrap();

        assert_eq!(status, JobStatus::Completed);
        let store = DataStore::new(pool, 1_000_000, 50_000);
        assert_eq!(store.row_count("sales_out").await.unwrap(), 3);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_job_cancelled_before_dispatch_is_skipped(pool: PgPool) {
        let job_id = seed_job(&pool, "return df\n").await;

        // cancel before the supervisor ever polls
        sqlx::query("UPDATE jobs SET status = 'killed'::job_status WHERE id = $1")
            .bind(job_id)
            .execute(&pool)
            .await
            .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(supervisor(pool.clone()).run(async {
            let _ = stop_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = stop_tx.send(());
        handle.await.unwrap();

        let queue = QueueManager::new(pool.clone());
        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Killed);

        let store = DataStore::new(pool, 1_000_000, 50_000);
        assert!(!store.table_exists("sales_out").await.unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_orphaned_running_job_is_settled_at_startup(pool: PgPool) {
        let job_id = seed_job(&pool, "return df\n").await;
        let queue = QueueManager::new(pool.clone());
        queue.mark_running(job_id).await.unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(supervisor(pool.clone()).run(async {
            let _ = stop_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = stop_tx.send(());
        handle.await.unwrap();

        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("orphaned"));
    }
}
