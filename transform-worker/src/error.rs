use thiserror::Error;

use transform_common::datastore::StoreError;
use transform_common::queue::QueueError;

/// Errors that escape a job executor. The supervisor catches these and
/// marks the job failed on the processor's behalf.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred: {0}")]
    Queue(#[from] QueueError),
    #[error("a storage error occurred: {0}")]
    Store(#[from] StoreError),
    #[error("job {0} not found")]
    JobNotFound(i64),
}
