//! One full compliance review pass over all eligible users.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::calendar::ExclusionCalendar;
use crate::clock::Clock;
use crate::dispatch::{Dispatcher, OutgoingMessage};
use crate::evaluate::{ComplianceEvaluator, ComplianceResult};
use crate::model::{ReviewConfig, User, UserId};
use crate::store::{ConfigStore, UserStore};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NotWorkingDay,
    Error,
}

/// Per-user outcome. The hour fields are absent when the evaluation itself
/// failed before anything could be computed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserReviewOutcome {
    pub user_id: UserId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_hours: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logged_hours: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_hours: Option<Decimal>,
    pub notification_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured result of one review run, returned to manual triggers and
/// logged by the scheduler. Partial success is always distinguishable from
/// total failure.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub total_users: usize,
    pub alerts_sent: usize,
    pub users_with_missing_hours: Vec<UserReviewOutcome>,
}

impl RunSummary {
    fn skipped(reason: SkipReason, date: Option<NaiveDate>) -> Self {
        Self {
            executed: false,
            reason: Some(reason),
            date,
            total_users: 0,
            alerts_sent: 0,
            users_with_missing_hours: Vec::new(),
        }
    }
}

/// Orchestrates one review pass: read config, pick the target date, evaluate
/// every eligible user sequentially, notify the deficient ones. A failure on
/// one user never aborts the rest of the run.
pub struct ReviewCoordinator {
    user_store: Arc<dyn UserStore>,
    config_store: Arc<dyn ConfigStore>,
    calendar: ExclusionCalendar,
    evaluator: ComplianceEvaluator,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    org_scope: Option<String>,
}

impl ReviewCoordinator {
    pub fn new(
        user_store: Arc<dyn UserStore>,
        config_store: Arc<dyn ConfigStore>,
        calendar: ExclusionCalendar,
        evaluator: ComplianceEvaluator,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        org_scope: Option<String>,
    ) -> Self {
        Self {
            user_store,
            config_store,
            calendar,
            evaluator,
            dispatcher,
            clock,
            org_scope,
        }
    }

    /// Runs one review. Never propagates an error: anything that prevents
    /// deciding whether to run is reported as a skipped summary instead.
    pub async fn run_once(&self) -> RunSummary {
        let today = self.clock.today();
        info!(%today, "Starting compliance review run");

        let config = match self.config_store.review_config().await {
            Ok(config) => config,
            Err(e) => {
                error!("Could not read review config: {}", e);
                return RunSummary::skipped(SkipReason::Error, None);
            }
        };
        if !config.enabled {
            info!("Review is disabled, skipping run");
            return RunSummary::skipped(SkipReason::Disabled, None);
        }

        // The review always evaluates the prior calendar day.
        let target_date = match today.pred_opt() {
            Some(date) => date,
            None => {
                error!("Date underflow computing review target from {}", today);
                return RunSummary::skipped(SkipReason::Error, None);
            }
        };

        if ExclusionCalendar::is_weekend(target_date) {
            info!(%target_date, "Previous day is a weekend, skipping run");
            return RunSummary::skipped(SkipReason::NotWorkingDay, Some(target_date));
        }
        match self.calendar.is_holiday(target_date).await {
            Ok(true) => {
                info!(%target_date, "Previous day is a holiday, skipping run");
                return RunSummary::skipped(SkipReason::NotWorkingDay, Some(target_date));
            }
            Ok(false) => {}
            Err(e) => {
                error!("Could not check holiday calendar: {}", e);
                return RunSummary::skipped(SkipReason::Error, Some(target_date));
            }
        }

        let users = match self
            .user_store
            .list_active_notifiable_users(self.org_scope.as_deref())
            .await
        {
            Ok(users) => users,
            Err(e) => {
                error!("Could not enumerate users: {}", e);
                return RunSummary::skipped(SkipReason::Error, Some(target_date));
            }
        };

        let total_users = users.len();
        let mut outcomes: Vec<UserReviewOutcome> = Vec::new();
        let mut alerts_sent = 0usize;

        for user in users {
            match self.evaluator.evaluate(&user.id, target_date).await {
                Ok(result) if result.is_deficient() => {
                    let message = Self::build_message(&user, &result, &config);
                    let outcome = match self.dispatcher.send(&message).await {
                        Ok(receipt) => {
                            alerts_sent += 1;
                            info!(
                                user_id = %user.id,
                                missing = %result.deficit_hours,
                                config = %receipt.config_name,
                                "Deficiency notification sent"
                            );
                            UserReviewOutcome {
                                user_id: user.id.clone(),
                                name: user.name.clone(),
                                required_hours: Some(result.required_hours),
                                logged_hours: Some(result.logged_hours),
                                missing_hours: Some(result.deficit_hours),
                                notification_sent: true,
                                error: None,
                            }
                        }
                        Err(e) => {
                            warn!(user_id = %user.id, "Deficiency notification failed: {}", e);
                            UserReviewOutcome {
                                user_id: user.id.clone(),
                                name: user.name.clone(),
                                required_hours: Some(result.required_hours),
                                logged_hours: Some(result.logged_hours),
                                missing_hours: Some(result.deficit_hours),
                                notification_sent: false,
                                error: Some(e.to_string()),
                            }
                        }
                    };
                    outcomes.push(outcome);
                }
                Ok(_) => {
                    // Compliant or excluded, nothing to report.
                }
                Err(e) => {
                    warn!(user_id = %user.id, "Evaluation failed: {}", e);
                    outcomes.push(UserReviewOutcome {
                        user_id: user.id.clone(),
                        name: user.name.clone(),
                        required_hours: None,
                        logged_hours: None,
                        missing_hours: None,
                        notification_sent: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(
            %target_date,
            total_users,
            alerts_sent,
            flagged = outcomes.len(),
            "Review run finished"
        );
        RunSummary {
            executed: true,
            reason: None,
            date: Some(target_date),
            total_users,
            alerts_sent,
            users_with_missing_hours: outcomes,
        }
    }

    fn build_message(
        user: &User,
        result: &ComplianceResult,
        config: &ReviewConfig,
    ) -> OutgoingMessage {
        let cc = config
            .notification_recipients
            .iter()
            .filter(|recipient| !recipient.eq_ignore_ascii_case(&user.email))
            .cloned()
            .collect();
        OutgoingMessage {
            to: user.email.clone(),
            cc,
            subject: format!("Missing time report hours for {}", result.date),
            body: format!(
                "Hi {},\n\n\
                 Your time report for {} shows {} of {} required hours.\n\
                 Missing: {} hours.\n\n\
                 Please complete your time report.\n",
                user.name,
                result.date,
                result.logged_hours,
                result.required_hours,
                result.deficit_hours
            ),
        }
    }
}
