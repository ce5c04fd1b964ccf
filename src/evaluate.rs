//! Compliance evaluation for a single user-day.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::model::{EngineError, UserId};
use crate::requirement::RequirementResolver;
use crate::store::TimeEntryStore;

/// Outcome of evaluating one user-day. Computed fresh on each run, never
/// persisted or cached across runs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComplianceResult {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub required_hours: Decimal,
    pub logged_hours: Decimal,
    pub deficit_hours: Decimal,
    pub excluded: bool,
}

impl ComplianceResult {
    pub fn is_deficient(&self) -> bool {
        !self.excluded && self.deficit_hours > Decimal::ZERO
    }
}

/// Combines the requirement resolver and the hours aggregate into the one
/// place that decides deficiency. All comparison policy lives here; hours
/// are compared at full decimal precision with no rounding.
#[derive(Clone)]
pub struct ComplianceEvaluator {
    resolver: RequirementResolver,
    time_entry_store: Arc<dyn TimeEntryStore>,
}

impl ComplianceEvaluator {
    pub fn new(resolver: RequirementResolver, time_entry_store: Arc<dyn TimeEntryStore>) -> Self {
        Self {
            resolver,
            time_entry_store,
        }
    }

    pub async fn evaluate(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<ComplianceResult, EngineError> {
        let required = self.resolver.required_hours(user_id, date).await?;
        if required == Decimal::ZERO {
            // Weekends, holidays, absences and zero-hour scheduled days are
            // all excluded uniformly, regardless of what was logged.
            return Ok(ComplianceResult {
                user_id: user_id.to_string(),
                date,
                required_hours: Decimal::ZERO,
                logged_hours: Decimal::ZERO,
                deficit_hours: Decimal::ZERO,
                excluded: true,
            });
        }

        let logged = self
            .time_entry_store
            .sum_hours_for_user_date(user_id, date)
            .await?;
        let deficit = (required - logged).max(Decimal::ZERO);
        Ok(ComplianceResult {
            user_id: user_id.to_string(),
            date,
            required_hours: required,
            logged_hours: logged,
            deficit_hours: deficit,
            excluded: false,
        })
    }
}
