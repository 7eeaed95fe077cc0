pub const JOBS_ENQUEUED: &str = "dispatch_jobs_enqueued";
pub const JOBS_STARTED: &str = "dispatch_jobs_started";
pub const JOBS_COMPLETED: &str = "dispatch_jobs_completed";
pub const JOBS_RETRIED: &str = "dispatch_jobs_retried";
pub const JOBS_FAILED: &str = "dispatch_jobs_failed";
pub const JOB_DURATION: &str = "dispatch_job_duration_seconds";
pub const QUEUE_ACTIVE_JOBS: &str = "dispatch_queue_active_jobs";

pub const WORKER_SATURATION: &str = "dispatch_worker_saturation_percent";
pub const WORKER_RATE_LIMITED: &str = "dispatch_worker_rate_limited";
pub const WORKER_STORE_ERRORS: &str = "dispatch_worker_store_errors";

pub const JANITOR_RUNS: &str = "dispatch_janitor_runs";
pub const JANITOR_COMPLETED_DELETED: &str = "dispatch_janitor_completed_deleted";
pub const JANITOR_FAILED_DELETED: &str = "dispatch_janitor_failed_deleted";
pub const JANITOR_ERRORS: &str = "dispatch_janitor_errors";
pub const JANITOR_DURATION: &str = "dispatch_janitor_duration_seconds";
