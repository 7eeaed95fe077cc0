//! Admission control for job starts: at most `max_starts` starts in any `window`-long span.
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_starts: NonZeroU32,
    pub window: Duration,
}

impl RateLimit {
    /// `None` when either bound is zero, which cannot admit anything meaningful.
    pub fn new(max_starts: u32, window: Duration) -> Option<Self> {
        if window.is_zero() {
            return None;
        }
        NonZeroU32::new(max_starts).map(|max_starts| Self { max_starts, window })
    }

    pub fn per_minute(max_starts: u32) -> Option<Self> {
        Self::new(max_starts, Duration::from_secs(60))
    }
}

/// Sliding window over the instants of recent starts.
///
/// Once `max_starts` starts fall inside the window, no further start is admitted until the
/// oldest of them leaves it. Only starts are counted, so long-running jobs never hold capacity.
#[derive(Debug)]
pub struct StartLimiter {
    limit: RateLimit,
    starts: Mutex<VecDeque<Instant>>,
}

impl StartLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            starts: Mutex::new(VecDeque::with_capacity(limit.max_starts.get() as usize)),
        }
    }

    fn expire(&self, starts: &mut VecDeque<Instant>, now: Instant) {
        while starts
            .front()
            .is_some_and(|oldest| *oldest + self.limit.window <= now)
        {
            starts.pop_front();
        }
    }

    /// How long until another start would be admitted. Zero means now.
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut starts = self.starts.lock().unwrap_or_else(PoisonError::into_inner);
        self.expire(&mut starts, now);

        if starts.len() < self.limit.max_starts.get() as usize {
            return Duration::ZERO;
        }
        starts
            .front()
            .map(|oldest| (*oldest + self.limit.window).saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Wait until a start would be admitted. Returns whether it had to wait at all.
    pub async fn until_ready(&self) -> bool {
        let mut waited = false;
        loop {
            let wait = self.wait_time();
            if wait.is_zero() {
                return waited;
            }
            waited = true;
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a start that happened now.
    pub fn record_start(&self) {
        let now = Instant::now();
        let mut starts = self.starts.lock().unwrap_or_else(PoisonError::into_inner);
        self.expire(&mut starts, now);
        starts.push_back(now);
    }
}
