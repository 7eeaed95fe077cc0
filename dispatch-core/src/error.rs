use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::types::{JobCategory, JobId};

/// Returned by producer and worker entry points once a queue has started shutting down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("queue {queue} is closed")]
pub struct QueueClosedError {
    pub queue: JobCategory,
}

/// Enumeration of parsing errors for values read from configuration or the database.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0} is not a valid job category")]
    UnknownCategory(String),
    #[error("{0} is not a valid job state")]
    UnknownState(String),
}

/// Enumeration of database-related errors.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("running migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
    #[error("row for job {id} is corrupt: {reason}")]
    CorruptRow { id: JobId, reason: String },
}

impl DatabaseError {
    pub(crate) fn query(command: &str, error: sqlx::Error) -> Self {
        DatabaseError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

/// Errors about a single job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} does not exist")]
    UnknownJob(JobId),
    // The job is not active, or another claim holds it
    #[error("job {id} is not held by lock {lock_id:?}")]
    InvalidLock { id: JobId, lock_id: Option<Uuid> },
}

/// Enumeration of errors for operations on a Queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Closed(#[from] QueueClosedError),
    #[error("payload of category {got} cannot be enqueued on queue {expected}")]
    CategoryMismatch {
        expected: JobCategory,
        got: JobCategory,
    },
    #[error("invalid {category} payload: {reason}")]
    InvalidPayload {
        category: JobCategory,
        reason: String,
    },
    #[error("invalid enqueue options: {0}")]
    InvalidOptions(String),
    #[error("queue {queue} still had {active} active jobs after {timeout:?}")]
    DrainTimeout {
        queue: JobCategory,
        timeout: Duration,
        active: usize,
    },
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl QueueError {
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed(_))
    }
}
