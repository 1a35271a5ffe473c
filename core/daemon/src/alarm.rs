//! Bad-posture run timers used to raise the alarm flag.
//!
//! Each identity gets its own timer so concurrent users cannot reset or
//! extend each other's countdown. Requests without a `User-ID` share a
//! single anonymous slot.

use chrono::{DateTime, Duration, Utc};
use posture_daemon_protocol::PostureStatus;
use std::collections::HashMap;

const ANONYMOUS: &str = "";

#[derive(Debug)]
pub struct BadRunTracker {
    threshold: Duration,
    started: HashMap<String, DateTime<Utc>>,
}

impl BadRunTracker {
    pub fn new(threshold_secs: i64) -> Self {
        Self {
            threshold: Duration::seconds(threshold_secs),
            started: HashMap::new(),
        }
    }

    /// Records a classification and returns whether the alarm should fire.
    pub fn observe(
        &mut self,
        identity: Option<&str>,
        status: PostureStatus,
        now: DateTime<Utc>,
    ) -> bool {
        let key = identity.unwrap_or(ANONYMOUS);
        match status {
            PostureStatus::Good => {
                self.started.remove(key);
                false
            }
            PostureStatus::Bad => {
                let started = *self.started.entry(key.to_string()).or_insert(now);
                now.signed_duration_since(started) >= self.threshold
            }
        }
    }

    /// Drops the identity's timer; the next BAD frame starts a new run.
    pub fn forget(&mut self, identity: Option<&str>) {
        self.started.remove(identity.unwrap_or(ANONYMOUS));
    }

    #[cfg(test)]
    pub fn bad_run_start(&self, identity: Option<&str>) -> Option<DateTime<Utc>> {
        self.started.get(identity.unwrap_or(ANONYMOUS)).copied()
    }

    pub fn active_runs(&self) -> usize {
        self.started.len()
    }
}
