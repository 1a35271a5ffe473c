//! HTTP wire types for posture-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to parse responses and build requests.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024; // 16MB
pub const USER_ID_HEADER: &str = "User-ID";

pub const ANALYZE_PATH: &str = "/analyze";
pub const SESSION_SUMMARY_PATH: &str = "/session_summary";
pub const REPORTS_PATH: &str = "/reports";
pub const HEALTH_PATH: &str = "/health";

pub const GOOD_POSTURE_LABEL: &str = "✅ Good Posture";
pub const BAD_POSTURE_LABEL: &str = "⚠️ Bad Posture, Please correct it!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostureStatus {
    Good,
    Bad,
}

impl PostureStatus {
    /// Human-readable label sent back to the browser client.
    pub fn label(self) -> &'static str {
        match self {
            PostureStatus::Good => GOOD_POSTURE_LABEL,
            PostureStatus::Bad => BAD_POSTURE_LABEL,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            GOOD_POSTURE_LABEL => Some(PostureStatus::Good),
            BAD_POSTURE_LABEL => Some(PostureStatus::Bad),
            _ => None,
        }
    }
}

impl fmt::Display for PostureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostureStatus::Good => f.write_str("good"),
            PostureStatus::Bad => f.write_str("bad"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub posture: String,
    pub alarm: bool,
}

impl AnalyzeResponse {
    pub fn new(status: PostureStatus, alarm: bool) -> Self {
        Self {
            posture: status.label().to_string(),
            alarm,
        }
    }

    pub fn status(&self) -> Option<PostureStatus> {
        PostureStatus::from_label(&self.posture)
    }
}

/// In-memory totals for one user, rounded for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub good: f64,
    pub bad: f64,
    pub alarms: u64,
}

/// Persisted totals for one user on one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub good: f64,
    pub bad: f64,
    pub alarms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportsResponse {
    pub reports: Vec<DailyReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Rounds a duration in seconds to two decimal places.
pub fn round_secs(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Returns the user id from a raw header value, ignoring blank values.
pub fn normalize_user_id(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
