use std::time::Duration;

use dispatch_core::{JobCategory, QueueError};
use thiserror::Error;

/// Enumeration of errors that stop a worker or keep it from starting.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue operation failed: {0}")]
    Queue(#[from] QueueError),
    #[error("a {handler} handler cannot serve queue {queue}")]
    CategoryMismatch {
        queue: JobCategory,
        handler: JobCategory,
    },
    #[error("worker for {category} aborted {active} jobs still running after {timeout:?}")]
    DrainTimeout {
        category: JobCategory,
        timeout: Duration,
        active: usize,
    },
    #[error("worker task for {category} did not finish: {error}")]
    Join {
        category: JobCategory,
        error: tokio::task::JoinError,
    },
}
