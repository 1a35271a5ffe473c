//! Per-user posture session totals and their reconciliation with the store.
//!
//! Every classification for a user attributes the wall time since that
//! user's previous classification to the status that was active during it,
//! so `good_seconds + bad_seconds` always equals the time since the user's
//! first frame. Alarms are debounced to one per contiguous bad run.
//!
//! Flushing merges each user's in-memory delta with the totals already
//! persisted for the day. Users whose read or write fails keep their session
//! untouched so the delta is retried on the next cycle; a failed read never
//! overwrites stored totals.
//!
//! A session is filed under the report day on which it started, so a delta
//! retried after midnight still lands in the earlier day's document.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use posture_daemon_protocol::{round_secs, PostureStatus, SessionSummary};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::clock::elapsed_secs;
use crate::store::{document_key, report_date, DailyTotals, DocumentStore};

#[derive(Debug, Clone, PartialEq)]
pub struct UserSession {
    pub good_seconds: f64,
    pub bad_seconds: f64,
    pub alarm_count: u64,
    pub last_status: PostureStatus,
    /// Start of the current contiguous status run.
    pub status_since: DateTime<Utc>,
    /// Instant up to which elapsed time has been attributed.
    pub accounted_until: DateTime<Utc>,
    pub alarm_already_counted: bool,
    /// Report day the session started on; flushed under this day's key.
    pub report_date: NaiveDate,
}

impl UserSession {
    fn new(status: PostureStatus, now: DateTime<Utc>, report_date: NaiveDate) -> Self {
        Self {
            good_seconds: 0.0,
            bad_seconds: 0.0,
            alarm_count: 0,
            last_status: status,
            status_since: now,
            accounted_until: now,
            alarm_already_counted: false,
            report_date,
        }
    }

    fn totals(&self) -> DailyTotals {
        DailyTotals {
            good: self.good_seconds,
            bad: self.bad_seconds,
            alarms: self.alarm_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub flush_due: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub struct SessionAggregator {
    sessions: HashMap<String, UserSession>,
    flush_interval: Duration,
    report_offset: FixedOffset,
    last_flush_at: DateTime<Utc>,
}

impl SessionAggregator {
    pub fn new(flush_interval_secs: i64, report_offset: FixedOffset, now: DateTime<Utc>) -> Self {
        Self {
            sessions: HashMap::new(),
            flush_interval: Duration::seconds(flush_interval_secs),
            report_offset,
            last_flush_at: now,
        }
    }

    pub fn record(
        &mut self,
        user_id: &str,
        status: PostureStatus,
        alarm_triggered: bool,
        now: DateTime<Utc>,
    ) -> RecordOutcome {
        let report_offset = self.report_offset;
        let session = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let date = report_date(now, report_offset);
                debug!(user_id = %user_id, status = %status, date = %date, "Session started");
                UserSession::new(status, now, date)
            });

        let elapsed = elapsed_secs(session.accounted_until, now);
        match session.last_status {
            PostureStatus::Good => session.good_seconds += elapsed,
            PostureStatus::Bad => session.bad_seconds += elapsed,
        }
        if now > session.accounted_until {
            session.accounted_until = now;
        }

        if alarm_triggered {
            if !session.alarm_already_counted {
                session.alarm_count += 1;
                session.alarm_already_counted = true;
                info!(
                    user_id = %user_id,
                    alarms = session.alarm_count,
                    "Posture alarm counted"
                );
            }
        } else {
            session.alarm_already_counted = false;
        }

        if status != session.last_status {
            debug!(
                user_id = %user_id,
                from = %session.last_status,
                to = %status,
                run_secs = elapsed_secs(session.status_since, now),
                "Posture run ended"
            );
            session.status_since = now;
            session.last_status = status;
        }

        RecordOutcome {
            flush_due: self.take_flush_slot(now),
        }
    }

    /// Claims the next flush slot if the interval has elapsed.
    fn take_flush_slot(&mut self, now: DateTime<Utc>) -> bool {
        if now.signed_duration_since(self.last_flush_at) >= self.flush_interval {
            self.last_flush_at = now;
            true
        } else {
            false
        }
    }

    /// Returns the user's rounded totals and forgets the user.
    pub fn summary(&mut self, user_id: &str) -> SessionSummary {
        match self.sessions.remove(user_id) {
            Some(session) => SessionSummary {
                good: round_secs(session.good_seconds),
                bad: round_secs(session.bad_seconds),
                alarms: session.alarm_count,
            },
            None => SessionSummary::default(),
        }
    }

    /// Merges every tracked user's delta into the stored totals for the day
    /// the user's session started.
    pub fn flush(&mut self, store: &dyn DocumentStore, collection: &str) -> FlushReport {
        let mut user_ids: Vec<String> = self.sessions.keys().cloned().collect();
        user_ids.sort();

        let mut report = FlushReport::default();
        for user_id in user_ids {
            let Some(session) = self.sessions.get(&user_id) else {
                continue;
            };
            let key = document_key(&user_id, session.report_date);

            let previous = match store.get(collection, &key) {
                Ok(Some(document)) => DailyTotals::from_document(&document),
                Ok(None) => DailyTotals::default(),
                Err(err) => {
                    warn!(error = %err, user_id = %user_id, "Store read failed; keeping delta");
                    report.failed.push(user_id);
                    continue;
                }
            };

            let combined = session.totals().combined(previous);
            match store.merge_upsert(collection, &key, &combined.to_fields()) {
                Ok(()) => {
                    debug!(
                        key = %key,
                        good = combined.good,
                        bad = combined.bad,
                        alarms = combined.alarms,
                        "Daily totals flushed"
                    );
                    report.flushed.push(user_id);
                }
                Err(err) => {
                    warn!(error = %err, user_id = %user_id, "Store write failed; keeping delta");
                    report.failed.push(user_id);
                }
            }
        }

        for user_id in &report.flushed {
            self.sessions.remove(user_id);
        }

        info!(
            flushed = report.flushed.len(),
            failed = report.failed.len(),
            "Flush cycle complete"
        );
        report
    }

    pub fn tracked_users(&self) -> usize {
        self.sessions.len()
    }

    pub fn last_flush_at(&self) -> DateTime<Utc> {
        self.last_flush_at
    }

    #[cfg(test)]
    pub fn session(&self, user_id: &str) -> Option<&UserSession> {
        self.sessions.get(user_id)
    }
}
