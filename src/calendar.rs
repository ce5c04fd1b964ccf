//! Exclusion calendar: weekends, holidays, and approved absences.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Weekday};

use crate::model::{AbsenceKind, EngineError};
use crate::store::CalendarStore;

/// Answers "is this a non-working day for this user?". Weekends are a pure
/// function of the date; holidays and absences come from the calendar store.
#[derive(Clone)]
pub struct ExclusionCalendar {
    calendar_store: Arc<dyn CalendarStore>,
}

impl ExclusionCalendar {
    pub fn new(calendar_store: Arc<dyn CalendarStore>) -> Self {
        Self { calendar_store }
    }

    pub fn is_weekend(date: NaiveDate) -> bool {
        let weekday = date.weekday();
        weekday == Weekday::Sat || weekday == Weekday::Sun
    }

    /// Holidays apply to all users uniformly; date-only comparison.
    pub async fn is_holiday(&self, date: NaiveDate) -> Result<bool, EngineError> {
        self.calendar_store.is_holiday(date).await
    }

    pub async fn absence_on(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AbsenceKind>, EngineError> {
        self.calendar_store.absence_for(user_id, date).await
    }

    pub async fn is_excluded(&self, user_id: &str, date: NaiveDate) -> Result<bool, EngineError> {
        if Self::is_weekend(date) {
            return Ok(true);
        }
        if self.is_holiday(date).await? {
            return Ok(true);
        }
        Ok(self.absence_on(user_id, date).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn d(date_str: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .unwrap_or_else(|_| panic!("Invalid date string format: {}", date_str))
    }

    fn calendar(store: &MemoryStore) -> ExclusionCalendar {
        ExclusionCalendar::new(Arc::new(store.clone()))
    }

    #[test]
    fn saturday_and_sunday_are_weekend() {
        assert!(ExclusionCalendar::is_weekend(d("2026-03-07")));
        assert!(ExclusionCalendar::is_weekend(d("2026-03-08")));
    }

    #[test]
    fn weekdays_are_not_weekend() {
        for date in ["2026-03-02", "2026-03-03", "2026-03-04", "2026-03-05", "2026-03-06"] {
            assert!(!ExclusionCalendar::is_weekend(d(date)), "{} should be a workday", date);
        }
    }

    #[tokio::test]
    async fn holiday_lookup_matches_seeded_date() {
        let store = MemoryStore::new();
        store.add_holiday(d("2026-06-19"), "Midsummer Eve").await;
        let cal = calendar(&store);

        assert!(cal.is_holiday(d("2026-06-19")).await.unwrap());
        assert!(!cal.is_holiday(d("2026-06-18")).await.unwrap());
    }

    #[tokio::test]
    async fn absence_lookup_returns_kind() {
        let store = MemoryStore::new();
        store.add_absence("u1", d("2026-03-03"), AbsenceKind::Vacation).await;
        let cal = calendar(&store);

        assert_eq!(
            cal.absence_on("u1", d("2026-03-03")).await.unwrap(),
            Some(AbsenceKind::Vacation)
        );
        assert_eq!(cal.absence_on("u1", d("2026-03-04")).await.unwrap(), None);
        assert_eq!(cal.absence_on("u2", d("2026-03-03")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn excluded_when_weekend_holiday_or_absent() {
        let store = MemoryStore::new();
        store.add_holiday(d("2026-04-06"), "Easter Monday").await;
        store.add_absence("u1", d("2026-03-03"), AbsenceKind::SickLeave).await;
        let cal = calendar(&store);

        // Plain Tuesday, nothing on record.
        assert!(!cal.is_excluded("u1", d("2026-03-10")).await.unwrap());
        // Weekend.
        assert!(cal.is_excluded("u1", d("2026-03-07")).await.unwrap());
        // Holiday applies to everyone.
        assert!(cal.is_excluded("u1", d("2026-04-06")).await.unwrap());
        assert!(cal.is_excluded("u2", d("2026-04-06")).await.unwrap());
        // Absence applies only to its user.
        assert!(cal.is_excluded("u1", d("2026-03-03")).await.unwrap());
        assert!(!cal.is_excluded("u2", d("2026-03-03")).await.unwrap());
    }
}
