//! Shared state owned by the daemon.
//!
//! All per-user totals live in one `SessionAggregator` behind a mutex. The
//! background flush holds that mutex for the whole cycle, so a concurrent
//! summary read either sees the state before the flush or after it.

use chrono::{DateTime, Utc};
use posture_daemon_protocol::{AnalyzeResponse, DailyReport, PostureStatus, SessionSummary};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::aggregator::{FlushReport, SessionAggregator};
use crate::alarm::BadRunTracker;
use crate::clock::Clock;
use crate::config::DaemonConfig;
use crate::detector::Detector;
use crate::error::{ConfigError, DetectError, StoreError};
use crate::store::{parse_report_date, user_key_prefix, DailyTotals, DocumentStore};

pub struct SharedState {
    detector: Detector,
    alarms: Mutex<BadRunTracker>,
    aggregator: Arc<Mutex<SessionAggregator>>,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    collection: String,
    flush_interval_secs: i64,
    started_at: DateTime<Utc>,
}

/// Result of one analyzed frame. `flush` is set when this frame kicked off
/// a background flush cycle.
pub struct Analysis {
    pub status: PostureStatus,
    pub response: AnalyzeResponse,
    pub flush: Option<JoinHandle<FlushReport>>,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub version: &'static str,
    pub tracked_users: usize,
    pub active_bad_runs: usize,
    pub flush_interval_secs: i64,
    pub last_flush_at: String,
    pub started_at: String,
}

impl SharedState {
    pub fn new(
        config: &DaemonConfig,
        detector: Detector,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let now = clock.now();
        let report_offset = config.report_offset()?;
        Ok(Self {
            detector,
            alarms: Mutex::new(BadRunTracker::new(config.tracking.alarm_threshold_secs)),
            aggregator: Arc::new(Mutex::new(SessionAggregator::new(
                config.tracking.flush_interval_secs,
                report_offset,
                now,
            ))),
            store,
            clock,
            collection: config.store.collection.clone(),
            flush_interval_secs: config.tracking.flush_interval_secs,
            started_at: now,
        })
    }

    /// Classifies a frame and, for identified users, folds it into their session.
    pub fn analyze(&self, user_id: Option<&str>, bytes: &[u8]) -> Result<Analysis, DetectError> {
        let status = self.detector.classify(bytes)?;
        let now = self.clock.now();
        let alarm = lock_or_recover(&self.alarms).observe(user_id, status, now);

        let mut flush = None;
        if let Some(user_id) = user_id {
            let outcome = lock_or_recover(&self.aggregator).record(user_id, status, alarm, now);
            if outcome.flush_due {
                flush = self.spawn_flush();
            }
        }

        Ok(Analysis {
            status,
            response: AnalyzeResponse::new(status, alarm),
            flush,
        })
    }

    /// Destructive read: the user's session and bad-run timer are both dropped.
    pub fn summary(&self, user_id: &str) -> SessionSummary {
        let summary = {
            let mut aggregator = lock_or_recover(&self.aggregator);
            lock_or_recover(&self.alarms).forget(Some(user_id));
            aggregator.summary(user_id)
        };
        tracing::info!(
            user_id = %user_id,
            good = summary.good,
            bad = summary.bad,
            alarms = summary.alarms,
            "Session summary read"
        );
        summary
    }

    pub fn daily_reports(&self, user_id: &str) -> Result<Vec<DailyReport>, StoreError> {
        let documents = self
            .store
            .list_prefix(&self.collection, &user_key_prefix(user_id))?;

        let mut reports: Vec<DailyReport> = documents
            .into_iter()
            .filter_map(|(key, document)| {
                let date = parse_report_date(user_id, &key)?;
                let totals = DailyTotals::from_document(&document);
                Some(DailyReport {
                    date,
                    good: totals.good,
                    bad: totals.bad,
                    alarms: totals.alarms,
                })
            })
            .collect();
        reports.sort_by_key(|report| report.date);
        Ok(reports)
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let (tracked_users, last_flush_at) = {
            let aggregator = lock_or_recover(&self.aggregator);
            (aggregator.tracked_users(), aggregator.last_flush_at())
        };
        HealthSnapshot {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            tracked_users,
            active_bad_runs: lock_or_recover(&self.alarms).active_runs(),
            flush_interval_secs: self.flush_interval_secs,
            last_flush_at: last_flush_at.to_rfc3339(),
            started_at: self.started_at.to_rfc3339(),
        }
    }

    fn spawn_flush(&self) -> Option<JoinHandle<FlushReport>> {
        let aggregator = Arc::clone(&self.aggregator);
        let store = Arc::clone(&self.store);
        let collection = self.collection.clone();

        let spawned = thread::Builder::new()
            .name("posture-flush".to_string())
            .spawn(move || {
                tracing::debug!(collection = %collection, "Flush cycle started");
                let mut aggregator = lock_or_recover(&aggregator);
                aggregator.flush(store.as_ref(), &collection)
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to spawn flush thread");
                None
            }
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovering poisoned state lock");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DetectorConfig;
    use crate::detector::test_frames::{centered_png, off_center_png};
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    const COLLECTION: &str = "posture_reports";

    struct Harness {
        state: SharedState,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        // 08:00 UTC is 13:30 in Colombo, well inside the same report day.
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 31, 8, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let config = DaemonConfig::default();
        let state = SharedState::new(
            &config,
            Detector::from_config(&DetectorConfig::default()),
            store.clone(),
            clock.clone(),
        )
        .expect("state");
        Harness {
            state,
            clock,
            store,
        }
    }

    fn doc(value: Value) -> crate::store::Document {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    #[test]
    fn analyze_scenario_raises_alarm_once() {
        let h = harness();
        let first = h.state.analyze(Some("u1"), &centered_png()).expect("frame 1");
        assert_eq!(first.status, PostureStatus::Good);
        assert!(!first.response.alarm);

        h.clock.advance_secs(5);
        let second = h.state.analyze(Some("u1"), &off_center_png()).expect("frame 2");
        assert_eq!(second.status, PostureStatus::Bad);
        assert!(!second.response.alarm);

        h.clock.advance_secs(12);
        let third = h.state.analyze(Some("u1"), &off_center_png()).expect("frame 3");
        assert!(third.response.alarm);

        let summary = h.state.summary("u1");
        assert_eq!(summary.good, 5.0);
        assert_eq!(summary.bad, 12.0);
        assert_eq!(summary.alarms, 1);
    }

    #[test]
    fn anonymous_frames_skip_aggregation() {
        let h = harness();
        let analysis = h.state.analyze(None, &off_center_png()).expect("frame");
        assert_eq!(analysis.status, PostureStatus::Bad);
        assert_eq!(h.state.health_snapshot().tracked_users, 0);
        assert_eq!(h.state.health_snapshot().active_bad_runs, 1);
    }

    #[test]
    fn decode_failure_has_no_side_effects() {
        let h = harness();
        assert!(h.state.analyze(Some("u1"), b"not an image").is_err());
        assert_eq!(h.state.health_snapshot().tracked_users, 0);
        assert_eq!(h.state.summary("u1"), SessionSummary::default());
    }

    #[test]
    fn summary_resets_bad_run_timer_for_next_session() {
        let h = harness();
        h.state.analyze(Some("u1"), &off_center_png()).expect("frame 1");
        h.state.summary("u1");
        assert_eq!(h.state.health_snapshot().active_bad_runs, 0);

        h.clock.advance_secs(3600);
        let next = h.state.analyze(Some("u1"), &off_center_png()).expect("frame 2");
        assert!(!next.response.alarm);
        assert_eq!(h.state.summary("u1").alarms, 0);
    }

    #[test]
    fn finished_sessions_do_not_leave_timers_behind() {
        let h = harness();
        for n in 0..50 {
            let user_id = format!("user-{}", n);
            h.state
                .analyze(Some(&user_id), &off_center_png())
                .expect("frame");
            h.state.summary(&user_id);
        }
        let health = h.state.health_snapshot();
        assert_eq!(health.tracked_users, 0);
        assert_eq!(health.active_bad_runs, 0);
    }

    #[test]
    fn summary_without_frames_is_zero() {
        let h = harness();
        assert_eq!(h.state.summary("nobody"), SessionSummary::default());
    }

    #[test]
    fn frame_after_interval_flushes_in_background() {
        let h = harness();
        h.store.insert(
            COLLECTION,
            "u1_2026-01-31",
            doc(json!({"good": 100.0, "bad": 20.0, "alarms": 1})),
        );

        h.state.analyze(Some("u1"), &centered_png()).expect("frame 1");
        h.clock.advance_secs(10);
        let analysis = h.state.analyze(Some("u1"), &centered_png()).expect("frame 2");
        assert!(analysis.flush.is_none());

        h.clock.advance_secs(50);
        let analysis = h.state.analyze(Some("u1"), &centered_png()).expect("frame 3");
        let report = analysis
            .flush
            .expect("flush spawned")
            .join()
            .expect("flush thread");
        assert_eq!(report.flushed, vec!["u1".to_string()]);

        let stored = h
            .store
            .document(COLLECTION, "u1_2026-01-31")
            .expect("document");
        assert_eq!(
            DailyTotals::from_document(&stored),
            DailyTotals {
                good: 160.0,
                bad: 20.0,
                alarms: 1
            }
        );
        assert_eq!(h.state.summary("u1"), SessionSummary::default());
    }

    #[test]
    fn daily_reports_are_sorted_by_date() {
        let h = harness();
        h.store.insert(
            COLLECTION,
            "u1_2026-02-01",
            doc(json!({"good": 5.0, "bad": 1.0, "alarms": 0})),
        );
        h.store.insert(
            COLLECTION,
            "u1_2026-01-30",
            doc(json!({"good": 7.0, "bad": 2.0, "alarms": 3})),
        );
        h.store
            .insert(COLLECTION, "u12_2026-01-30", doc(json!({"good": 99.0})));

        let reports = h.state.daily_reports("u1").expect("reports");
        let dates: Vec<String> = reports.iter().map(|r| r.date.to_string()).collect();
        assert_eq!(dates, vec!["2026-01-30", "2026-02-01"]);
        assert_eq!(reports[0].alarms, 3);
    }
}
