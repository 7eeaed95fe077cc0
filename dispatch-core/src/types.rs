use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;
use crate::registry::{JobPayload, JobResult};

pub type JobId = Uuid;

/// The task categories jobs are dispatched under. Every category owns exactly one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCategory {
    Email,
    Export,
    Analytics,
    Ai,
    Notification,
}

impl JobCategory {
    pub const ALL: [JobCategory; 5] = [
        JobCategory::Email,
        JobCategory::Export,
        JobCategory::Analytics,
        JobCategory::Ai,
        JobCategory::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::Email => "email",
            JobCategory::Export => "export",
            JobCategory::Analytics => "analytics",
            JobCategory::Ai => "ai",
            JobCategory::Notification => "notification",
        }
    }

    /// Position of this category in `ALL`.
    pub fn index(&self) -> usize {
        match self {
            JobCategory::Email => 0,
            JobCategory::Export => 1,
            JobCategory::Analytics => 2,
            JobCategory::Ai => 3,
            JobCategory::Notification => 4,
        }
    }

    /// Priority given to jobs enqueued without an explicit one. Lower is served first.
    pub fn default_priority(&self) -> i16 {
        match self {
            JobCategory::Email | JobCategory::Notification => 1,
            JobCategory::Export | JobCategory::Ai => 2,
            JobCategory::Analytics => 3,
        }
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobCategory {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "email" => Ok(JobCategory::Email),
            "export" => Ok(JobCategory::Export),
            "analytics" => Ok(JobCategory::Analytics),
            "ai" => Ok(JobCategory::Ai),
            "notification" => Ok(JobCategory::Notification),
            invalid => Err(ParseError::UnknownCategory(invalid.to_owned())),
        }
    }
}

/// Enumeration of possible states for a Job.
/// Pending: waiting in the queue, possibly until a delay elapses.
/// Active: claimed by a worker and currently running.
/// Completed: the handler returned a result.
/// Failed: the handler failed on the last allowed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "dispatch_job_state", rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl FromStr for JobState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            invalid => Err(ParseError::UnknownState(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub category: JobCategory,
    pub state: JobState,
    pub priority: i16,
    // Incremented on every claim, so it is the number of the attempt currently running
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: JobPayload,
    pub result: Option<JobResult>,
    pub last_error: Option<String>,
    // Set while the job is active; completion and failure must present it
    pub lock_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// A NewJob to be inserted into a JobStore.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub category: JobCategory,
    pub priority: i16,
    pub max_attempts: u32,
    pub payload: JobPayload,
    /// How long the job stays invisible to workers after insertion.
    pub delay: Duration,
}

/// A job handed out by `Queue::claim`. Completing or failing it consumes the claim, so a job
/// is reported back to its queue exactly once.
#[derive(Debug)]
pub struct ClaimedJob {
    job: Job,
}

impl ClaimedJob {
    pub(crate) fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub(crate) fn into_job(self) -> Job {
        self.job
    }
}
