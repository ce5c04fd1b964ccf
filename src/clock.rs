//! Wall-clock seam so the coordinator and scheduler can be driven by tests.

use chrono::{Local, NaiveDate, NaiveDateTime};

pub trait Clock: Send + Sync {
    /// Current local wall-clock time.
    fn now(&self) -> NaiveDateTime;

    /// Current local calendar date.
    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// System local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedClock;
    use super::*;

    #[test]
    fn fixed_clock_reports_and_advances_time() {
        let clock = FixedClock::at("2026-03-04 12:00:00");
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());

        clock.advance(chrono::Duration::hours(13));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2026, 3, 5).unwrap());
    }
}
