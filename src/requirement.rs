//! Work-requirement resolution: how many hours a user must log on a date.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Weekday};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::calendar::ExclusionCalendar;
use crate::model::{EngineError, WeekdayHours, WorkSchedulePeriod};
use crate::store::ScheduleStore;

/// Hours required on a weekday with no explicit schedule value. This default
/// lives here and only here; missing schedule fields must not be defaulted
/// at call sites.
const DEFAULT_DAILY_HOURS: Decimal = dec!(8);

/// Fridays are shorter in the system default schedule.
const DEFAULT_FRIDAY_HOURS: Decimal = dec!(7);

/// Resolves required hours for a (user, date): zero when the day is
/// excluded, else the user's weekday schedule (or the system default),
/// overridden by a reduced-hour period containing the date.
#[derive(Clone)]
pub struct RequirementResolver {
    schedule_store: Arc<dyn ScheduleStore>,
    calendar: ExclusionCalendar,
}

impl RequirementResolver {
    pub fn new(schedule_store: Arc<dyn ScheduleStore>, calendar: ExclusionCalendar) -> Self {
        Self {
            schedule_store,
            calendar,
        }
    }

    pub async fn required_hours(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Decimal, EngineError> {
        if self.calendar.is_excluded(user_id, date).await? {
            debug!(user_id, %date, "Day is excluded, required hours are 0");
            return Ok(Decimal::ZERO);
        }

        let weekday = date.weekday();
        let base = match self.schedule_store.workday_schedule_for_user(user_id).await? {
            Some(schedule) => Self::scheduled_hours(&schedule, weekday),
            None => Self::default_hours(weekday),
        };

        let periods = self.schedule_store.list_reduced_periods().await?;
        let matching: Vec<&WorkSchedulePeriod> =
            periods.iter().filter(|p| p.contains(date)).collect();
        match matching.as_slice() {
            [] => Ok(base),
            [period] => {
                debug!(user_id, %date, period = %period.name, hours = %period.daily_hours,
                    "Reduced period overrides weekday hours");
                Ok(period.daily_hours)
            }
            [first, rest @ ..] => {
                // Overlap is a configuration error; first match in list order wins.
                warn!(
                    %date,
                    applied = %first.name,
                    ignored = %rest.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", "),
                    "Multiple reduced periods contain this date"
                );
                Ok(first.daily_hours)
            }
        }
    }

    fn scheduled_hours(schedule: &WeekdayHours, weekday: Weekday) -> Decimal {
        let explicit = match weekday {
            Weekday::Mon => schedule.monday,
            Weekday::Tue => schedule.tuesday,
            Weekday::Wed => schedule.wednesday,
            Weekday::Thu => schedule.thursday,
            Weekday::Fri => schedule.friday,
            // Weekends are excluded before this is consulted.
            Weekday::Sat | Weekday::Sun => return Decimal::ZERO,
        };
        explicit.unwrap_or(DEFAULT_DAILY_HOURS)
    }

    fn default_hours(weekday: Weekday) -> Decimal {
        match weekday {
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu => DEFAULT_DAILY_HOURS,
            Weekday::Fri => DEFAULT_FRIDAY_HOURS,
            Weekday::Sat | Weekday::Sun => Decimal::ZERO,
        }
    }
}
