//! Attendance compliance engine for the Tally time tracking backend.
//!
//! Once per day the engine checks, for every active user, whether enough
//! hours were logged for the previous working day. Deficient users are
//! notified over SMTP, trying an ordered list of delivery configurations
//! with retry and capped exponential backoff. A self-rescheduling timer
//! loop drives the daily run and chains waits around the maximum single
//! timer delay.

pub mod calendar;
pub mod clock;
pub mod dispatch;
pub mod evaluate;
pub mod model;
pub mod requirement;
pub mod review;
pub mod schedule;
pub mod store;
