//! Collaborator store interfaces and the in-memory implementation.
//!
//! The engine only ever talks to these traits; the application's relational
//! persistence layer implements them behind the same signatures. Store
//! failures surface as [`EngineError::DataUnavailable`] and are contained
//! per user by the run coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{
    AbsenceKind, EngineError, ReviewConfig, TimeEntry, User, UserId, WeekdayHours,
    WorkSchedulePeriod,
};

// --- Store Interfaces ---

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Users that are active, have notifications enabled, and (when a scope
    /// is given) belong to the monitored organization. Enumeration order is
    /// stable so runs process users deterministically.
    async fn list_active_notifiable_users(
        &self,
        org_scope: Option<&str>,
    ) -> Result<Vec<User>, EngineError>;
}

#[async_trait]
pub trait TimeEntryStore: Send + Sync {
    /// Sum of logged hours for (user, date). Zero when nothing was logged.
    async fn sum_hours_for_user_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Decimal, EngineError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn workday_schedule_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<WeekdayHours>, EngineError>;

    /// Reduced-hour periods in configuration order. Order matters: the
    /// resolver applies the first period containing a date.
    async fn list_reduced_periods(&self) -> Result<Vec<WorkSchedulePeriod>, EngineError>;
}

#[async_trait]
pub trait CalendarStore: Send + Sync {
    async fn is_holiday(&self, date: NaiveDate) -> Result<bool, EngineError>;

    async fn absence_for(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AbsenceKind>, EngineError>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn review_config(&self) -> Result<ReviewConfig, EngineError>;

    /// Persist a new config. Implementations must validate before storing
    /// so an invalid config is rejected at the write site, never defaulted.
    async fn save_review_config(&self, config: ReviewConfig) -> Result<(), EngineError>;
}

// --- In-Memory Implementation ---

#[derive(Debug, Clone)]
struct StoredUser {
    user: User,
    active: bool,
    notifications_enabled: bool,
}

/// Hash-map backed store implementing every collaborator interface. Backs
/// the standalone binary and the test suites; a SQL-backed implementation
/// is a drop-in behind the same traits.
#[derive(Clone)]
pub struct MemoryStore {
    users: Arc<Mutex<HashMap<UserId, StoredUser>>>,
    time_entries: Arc<Mutex<HashMap<(UserId, NaiveDate), Vec<TimeEntry>>>>,
    schedules: Arc<Mutex<HashMap<UserId, WeekdayHours>>>,
    reduced_periods: Arc<Mutex<Vec<WorkSchedulePeriod>>>,
    holidays: Arc<Mutex<HashMap<NaiveDate, String>>>,
    absences: Arc<Mutex<HashMap<(UserId, NaiveDate), AbsenceKind>>>,
    review_config: Arc<Mutex<ReviewConfig>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: Arc::new(Mutex::new(HashMap::new())),
            time_entries: Arc::new(Mutex::new(HashMap::new())),
            schedules: Arc::new(Mutex::new(HashMap::new())),
            reduced_periods: Arc::new(Mutex::new(Vec::new())),
            holidays: Arc::new(Mutex::new(HashMap::new())),
            absences: Arc::new(Mutex::new(HashMap::new())),
            review_config: Arc::new(Mutex::new(ReviewConfig::default())),
        }
    }

    // --- Seeding Methods ---

    /// Adds an active user with notifications enabled.
    pub async fn add_user(&self, user: User) {
        self.add_user_with_flags(user, true, true).await;
    }

    pub async fn add_user_with_flags(&self, user: User, active: bool, notifications_enabled: bool) {
        info!(user_id = %user.id, active, notifications_enabled, "Adding user");
        self.users.lock().await.insert(
            user.id.clone(),
            StoredUser {
                user,
                active,
                notifications_enabled,
            },
        );
    }

    pub async fn add_time_entry(&self, entry: TimeEntry) {
        debug!(user_id = %entry.user_id, date = %entry.date, hours = %entry.hours, "Adding time entry");
        self.time_entries
            .lock()
            .await
            .entry((entry.user_id.clone(), entry.date))
            .or_default()
            .push(entry);
    }

    pub async fn set_workday_schedule(&self, user_id: &str, schedule: WeekdayHours) {
        info!(user_id, "Setting workday schedule");
        self.schedules
            .lock()
            .await
            .insert(user_id.to_string(), schedule);
    }

    pub async fn add_reduced_period(&self, period: WorkSchedulePeriod) {
        info!(
            name = %period.name,
            span = %format!("{}..{}", period.start, period.end),
            hours = %period.daily_hours,
            "Adding reduced-hour period"
        );
        self.reduced_periods.lock().await.push(period);
    }

    pub async fn add_holiday(&self, date: NaiveDate, name: &str) {
        info!(%date, name, "Adding holiday");
        self.holidays.lock().await.insert(date, name.to_string());
    }

    pub async fn add_absence(&self, user_id: &str, date: NaiveDate, kind: AbsenceKind) {
        info!(user_id, %date, ?kind, "Adding absence");
        self.absences
            .lock()
            .await
            .insert((user_id.to_string(), date), kind);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn list_active_notifiable_users(
        &self,
        org_scope: Option<&str>,
    ) -> Result<Vec<User>, EngineError> {
        let users = self.users.lock().await;
        let mut selected: Vec<User> = users
            .values()
            .filter(|stored| stored.active && stored.notifications_enabled)
            .filter(|stored| org_scope.map_or(true, |org| stored.user.organization == org))
            .map(|stored| stored.user.clone())
            .collect();
        // Stable order so per-run side effects are deterministic.
        selected.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(selected)
    }
}

#[async_trait]
impl TimeEntryStore for MemoryStore {
    async fn sum_hours_for_user_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Decimal, EngineError> {
        let entries = self.time_entries.lock().await;
        let total = entries
            .get(&(user_id.to_string(), date))
            .map(|day_entries| day_entries.iter().map(|e| e.hours).sum())
            .unwrap_or(Decimal::ZERO);
        Ok(total)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn workday_schedule_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<WeekdayHours>, EngineError> {
        Ok(self.schedules.lock().await.get(user_id).cloned())
    }

    async fn list_reduced_periods(&self) -> Result<Vec<WorkSchedulePeriod>, EngineError> {
        Ok(self.reduced_periods.lock().await.clone())
    }
}

#[async_trait]
impl CalendarStore for MemoryStore {
    async fn is_holiday(&self, date: NaiveDate) -> Result<bool, EngineError> {
        Ok(self.holidays.lock().await.contains_key(&date))
    }

    async fn absence_for(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AbsenceKind>, EngineError> {
        Ok(self
            .absences
            .lock()
            .await
            .get(&(user_id.to_string(), date))
            .copied())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn review_config(&self) -> Result<ReviewConfig, EngineError> {
        Ok(self.review_config.lock().await.clone())
    }

    async fn save_review_config(&self, config: ReviewConfig) -> Result<(), EngineError> {
        config.validate()?;
        info!(
            enabled = config.enabled,
            review_time = %config.review_time,
            recipients = config.notification_recipients.len(),
            "Saving review config"
        );
        *self.review_config.lock().await = config;
        Ok(())
    }
}
