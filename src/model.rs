//! Domain types shared across the compliance engine.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime};
use lettre::message::Mailbox;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Error Types ---

/// Failure taxonomy for the engine. Failures local to one user or one
/// notification are contained by the run coordinator; only configuration
/// and scheduling errors escalate to the retry logic in the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Required data unavailable: {detail}")]
    DataUnavailable { detail: String },
    #[error("Invalid review configuration: {detail}")]
    ConfigInvalid { detail: String },
    #[error("Notification delivery failed after {configs_tried} configuration(s): {detail}")]
    DeliveryFailed { configs_tried: usize, detail: String },
    #[error("Could not compute next review run: {detail}")]
    ScheduleComputeFailed { detail: String },
}

impl EngineError {
    pub fn data_unavailable(detail: impl Into<String>) -> Self {
        EngineError::DataUnavailable {
            detail: detail.into(),
        }
    }

    pub fn config_invalid(detail: impl Into<String>) -> Self {
        EngineError::ConfigInvalid {
            detail: detail.into(),
        }
    }

    pub fn schedule_compute_failed(detail: impl Into<String>) -> Self {
        EngineError::ScheduleComputeFailed {
            detail: detail.into(),
        }
    }
}

// --- Core Data Structures ---

pub type UserId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub organization: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceKind {
    Vacation,
    SickLeave,
}

/// One logged block of work. Several entries may exist for the same
/// (user, date); compliance sums them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeEntry {
    pub user_id: UserId,
    pub task_id: String,
    pub date: NaiveDate,
    pub hours: Decimal,
}

/// Per-user weekday schedule. A `None` field means "not configured" and
/// falls back to the resolver's documented default, not to zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WeekdayHours {
    pub monday: Option<Decimal>,
    pub tuesday: Option<Decimal>,
    pub wednesday: Option<Decimal>,
    pub thursday: Option<Decimal>,
    pub friday: Option<Decimal>,
}

/// Year-agnostic calendar position. Ordering is calendar order within one
/// year (month first, then day), which the derive gives us from field order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> Result<Self, EngineError> {
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(EngineError::config_invalid(format!(
                "invalid month-day {:02}-{:02}",
                month, day
            )));
        }
        Ok(Self { month, day })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            day: date.day(),
        }
    }
}

impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

/// A recurring span of reduced daily hours, keyed by month-day so it
/// applies every year. `start > end` means the span wraps the year
/// boundary, e.g. Dec 20 through Jan 10.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkSchedulePeriod {
    pub name: String,
    pub start: MonthDay,
    pub end: MonthDay,
    /// Flat required hours per day inside the span, independent of weekday.
    pub daily_hours: Decimal,
}

impl WorkSchedulePeriod {
    pub fn contains(&self, date: NaiveDate) -> bool {
        let md = MonthDay::of(date);
        if self.start <= self.end {
            self.start <= md && md <= self.end
        } else {
            // Wraps through Dec 31 into Jan 1.
            md >= self.start || md <= self.end
        }
    }
}

// --- Review Configuration ---

pub const DEFAULT_REVIEW_TIME: &str = "06:00";

static REVIEW_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]\d|2[0-3]):([0-5]\d)$").expect("review time pattern compiles"));

/// Settings for the daily review. Persisted through the config store and
/// read once per scheduling cycle; changes are not hot-reloaded mid-run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewConfig {
    pub enabled: bool,
    /// Local wall-clock time of day, 24-hour `HH:MM`.
    pub review_time: String,
    /// Extra addresses CC'd on every deficiency notification.
    #[serde(default)]
    pub notification_recipients: Vec<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            review_time: DEFAULT_REVIEW_TIME.to_string(),
            notification_recipients: Vec::new(),
        }
    }
}

impl ReviewConfig {
    /// Field-format validation, applied on every write. A stored config is
    /// assumed valid on read.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !REVIEW_TIME_RE.is_match(&self.review_time) {
            return Err(EngineError::config_invalid(format!(
                "review_time '{}' is not in 24-hour HH:MM format",
                self.review_time
            )));
        }
        for recipient in &self.notification_recipients {
            if recipient.parse::<Mailbox>().is_err() {
                return Err(EngineError::config_invalid(format!(
                    "notification recipient '{}' is not a valid address",
                    recipient
                )));
            }
        }
        Ok(())
    }

    pub fn review_time_parsed(&self) -> Result<NaiveTime, EngineError> {
        NaiveTime::parse_from_str(&self.review_time, "%H:%M").map_err(|e| {
            EngineError::config_invalid(format!("review_time '{}': {}", self.review_time, e))
        })
    }
}
