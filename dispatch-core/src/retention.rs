//! # Retention
//!
//! Decides which finished jobs the janitor keeps around for inspection.
use chrono::{DateTime, Duration, Utc};

/// Bounds on how many finished jobs of one outcome a queue keeps.
///
/// A finished job is kept while it is among the `max_count` most recently finished OR finished
/// less than `max_age` ago, and deleted only once it falls outside every configured bound.
/// A policy with no bound keeps everything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_count: Option<usize>,
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    pub fn new(max_count: Option<usize>, max_age: Option<Duration>) -> Self {
        Self { max_count, max_age }
    }

    /// 100 most recent, or anything from the last 24 hours.
    pub fn completed_default() -> Self {
        Self::new(Some(100), Some(Duration::hours(24)))
    }

    /// 500 most recent, or anything from the last 7 days.
    pub fn failed_default() -> Self {
        Self::new(Some(500), Some(Duration::days(7)))
    }

    pub fn keep_all() -> Self {
        Self::new(None, None)
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_count.is_none() && self.max_age.is_none()
    }

    /// Whether a job finished at `finished_at`, ranked `rank` among its queue's finished jobs of
    /// the same outcome (0 is the most recent), survives a cleanup running at `now`.
    pub fn retains(&self, rank: usize, finished_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.is_unbounded() {
            return true;
        }

        let within_count = self.max_count.is_some_and(|max_count| rank < max_count);
        let within_age = self
            .max_age
            .is_some_and(|max_age| now.signed_duration_since(finished_at) < max_age);

        within_count || within_age
    }

    /// The oldest finish time still retained by age, if an age bound is set.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_age.map(|max_age| now - max_age)
    }
}
