//! Self-rescheduling daily timer that drives the review coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::model::EngineError;
use crate::review::ReviewCoordinator;
use crate::store::ConfigStore;

/// Longest delay a single platform timer is trusted with. Anything longer is
/// chained: sleep one full segment, then recompute the target from scratch.
pub const MAX_TIMER_DELAY_MS: u64 = i32::MAX as u64;

const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_COMPUTE_RETRY_DELAY: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Computing the next run.
    Idle,
    /// A timer is set.
    Armed,
    /// A review run is in progress.
    Firing,
    /// Reviews are disabled; the loop has exited and only a process restart
    /// or a manual trigger runs reviews again.
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub next_run: Option<NaiveDateTime>,
    pub timers_armed: u64,
    pub runs_completed: u64,
}

/// Owns the schedule loop. `start` spawns the loop task, `stop` asks it to
/// exit at the next wakeup.
pub struct ReviewScheduler {
    coordinator: Arc<ReviewCoordinator>,
    config_store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    status: Mutex<(SchedulerState, Option<NaiveDateTime>)>,
    timers_armed: AtomicU64,
    runs_completed: AtomicU64,
    startup_delay: Duration,
    timer_ceiling: Duration,
    compute_retry_delay: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ReviewScheduler {
    pub fn new(
        coordinator: Arc<ReviewCoordinator>,
        config_store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            coordinator,
            config_store,
            clock,
            status: Mutex::new((SchedulerState::Idle, None)),
            timers_armed: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            startup_delay: DEFAULT_STARTUP_DELAY,
            timer_ceiling: Duration::from_millis(MAX_TIMER_DELAY_MS),
            compute_retry_delay: DEFAULT_COMPUTE_RETRY_DELAY,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Shrinks the fixed delays. Intended for tests.
    pub fn with_timing(
        mut self,
        startup_delay: Duration,
        timer_ceiling: Duration,
        compute_retry_delay: Duration,
    ) -> Self {
        self.startup_delay = startup_delay;
        self.timer_ceiling = timer_ceiling;
        self.compute_retry_delay = compute_retry_delay;
        self
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_loop().await })
    }

    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("No scheduler loop is listening for shutdown");
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let (state, next_run) = *self.status.lock().await;
        SchedulerStatus {
            state,
            next_run,
            timers_armed: self.timers_armed.load(Ordering::SeqCst),
            runs_completed: self.runs_completed.load(Ordering::SeqCst),
        }
    }

    /// Next run strictly after `now`: today if the review time is still
    /// ahead, otherwise tomorrow. A run exactly at the review time schedules
    /// for the next day.
    fn next_occurrence(
        now: NaiveDateTime,
        review_time: NaiveTime,
    ) -> Result<NaiveDateTime, EngineError> {
        let today_at = now.date().and_time(review_time);
        if today_at > now {
            return Ok(today_at);
        }
        now.date()
            .succ_opt()
            .map(|date| date.and_time(review_time))
            .ok_or_else(|| {
                EngineError::schedule_compute_failed(format!(
                    "no calendar day after {}",
                    now.date()
                ))
            })
    }

    /// Returns true when shutdown was requested before the delay elapsed.
    async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown.changed() => true,
        }
    }

    async fn set_status(&self, state: SchedulerState, next_run: Option<NaiveDateTime>) {
        *self.status.lock().await = (state, next_run);
    }

    async fn run_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();

        if Self::wait_or_shutdown(self.startup_delay, &mut shutdown).await {
            return;
        }

        loop {
            self.set_status(SchedulerState::Idle, None).await;

            let config = match self.config_store.review_config().await {
                Ok(config) => config,
                Err(e) => {
                    warn!("Could not read review config, retrying later: {}", e);
                    if Self::wait_or_shutdown(self.compute_retry_delay, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            if !config.enabled {
                info!("Reviews are disabled, scheduler is parking");
                self.set_status(SchedulerState::Disabled, None).await;
                return;
            }

            let review_time = match config.review_time_parsed() {
                Ok(time) => time,
                Err(e) => {
                    warn!("Could not parse review time, retrying later: {}", e);
                    if Self::wait_or_shutdown(self.compute_retry_delay, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            let now = self.clock.now();
            let target = match Self::next_occurrence(now, review_time) {
                Ok(target) => target,
                Err(e) => {
                    warn!("Could not compute next run, retrying later: {}", e);
                    if Self::wait_or_shutdown(self.compute_retry_delay, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };
            let delay = match (target - now).to_std() {
                Ok(delay) => delay,
                Err(e) => {
                    warn!("Next run {} is not in the future: {}", target, e);
                    if Self::wait_or_shutdown(self.compute_retry_delay, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            self.timers_armed.fetch_add(1, Ordering::SeqCst);
            self.set_status(SchedulerState::Armed, Some(target)).await;

            if delay > self.timer_ceiling {
                debug!(%target, "Delay exceeds timer ceiling, sleeping one segment");
                if Self::wait_or_shutdown(self.timer_ceiling, &mut shutdown).await {
                    return;
                }
                // Recompute from scratch so config edits take effect at the
                // next segment boundary.
                continue;
            }

            info!(%target, "Next review run armed");
            if Self::wait_or_shutdown(delay, &mut shutdown).await {
                return;
            }

            self.set_status(SchedulerState::Firing, Some(target)).await;
            let summary = self.coordinator.run_once().await;
            self.runs_completed.fetch_add(1, Ordering::SeqCst);
            info!(
                executed = summary.executed,
                alerts_sent = summary.alerts_sent,
                "Scheduled review run finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ExclusionCalendar;
    use crate::clock::testing::PausedClock;
    use crate::dispatch::testing::MockMailer;
    use crate::dispatch::{DeliveryConfig, Dispatcher};
    use crate::evaluate::ComplianceEvaluator;
    use crate::model::ReviewConfig;
    use crate::requirement::RequirementResolver;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn dt(datetime_str: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S")
            .unwrap_or_else(|_| panic!("Invalid datetime string format: {}", datetime_str))
    }

    fn t(time_str: &str) -> NaiveTime {
        NaiveTime::parse_from_str(time_str, "%H:%M")
            .unwrap_or_else(|_| panic!("Invalid time string format: {}", time_str))
    }

    /// Scheduler over an empty store with short test delays: 1s startup,
    /// 40s timer ceiling, 5s compute retry.
    fn build_scheduler(
        store: &MemoryStore,
        clock: Arc<dyn Clock>,
        config_store: Arc<dyn ConfigStore>,
    ) -> Arc<ReviewScheduler> {
        let base = Arc::new(store.clone());
        let calendar = ExclusionCalendar::new(base.clone());
        let resolver = RequirementResolver::new(base.clone(), calendar.clone());
        let evaluator = ComplianceEvaluator::new(resolver, base.clone());
        let dispatcher = Arc::new(
            Dispatcher::new(
                DeliveryConfig::standard_ladder("mail.example.com"),
                MockMailer::succeeding(),
            )
            .unwrap(),
        );
        let coordinator = Arc::new(ReviewCoordinator::new(
            base.clone(),
            config_store.clone(),
            calendar,
            evaluator,
            dispatcher,
            clock.clone(),
            None,
        ));
        Arc::new(
            ReviewScheduler::new(coordinator, config_store, clock).with_timing(
                Duration::from_secs(1),
                Duration::from_secs(40),
                Duration::from_secs(5),
            ),
        )
    }

    #[test]
    fn next_occurrence_is_today_when_review_time_is_ahead() {
        let next = ReviewScheduler::next_occurrence(dt("2026-03-04 05:30:00"), t("06:00"));
        assert_eq!(next.unwrap(), dt("2026-03-04 06:00:00"));
    }

    #[test]
    fn next_occurrence_is_tomorrow_when_review_time_has_passed() {
        let next = ReviewScheduler::next_occurrence(dt("2026-03-04 09:15:00"), t("06:00"));
        assert_eq!(next.unwrap(), dt("2026-03-05 06:00:00"));
    }

    #[test]
    fn next_occurrence_exactly_at_review_time_is_tomorrow() {
        let next = ReviewScheduler::next_occurrence(dt("2026-03-04 06:00:00"), t("06:00"));
        assert_eq!(next.unwrap(), dt("2026-03-05 06:00:00"));
    }

    #[tokio::test(start_paused = true)]
    async fn long_delay_is_chained_and_fires_exactly_once() {
        let store = MemoryStore::new();
        store
            .save_review_config(ReviewConfig {
                review_time: "12:00".to_string(),
                ..ReviewConfig::default()
            })
            .await
            .unwrap();
        // 130s to the review time against a 40s ceiling: three full
        // segments, then one precise timer.
        let clock = Arc::new(PausedClock::starting_at("2026-03-04 11:57:50"));
        let scheduler = build_scheduler(&store, clock, Arc::new(store.clone()));
        let handle = scheduler.start();

        tokio::time::sleep(Duration::from_secs(150)).await;

        let status = scheduler.status().await;
        assert_eq!(status.runs_completed, 1);
        assert!(
            status.timers_armed >= 4,
            "expected at least 4 armed timers, got {}",
            status.timers_armed
        );

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fires_and_rearms_for_the_next_day() {
        let store = MemoryStore::new();
        // Default config reviews at 06:00; 29s out after the startup delay.
        let clock = Arc::new(PausedClock::starting_at("2026-03-04 05:59:30"));
        let scheduler = build_scheduler(&store, clock, Arc::new(store.clone()));
        let handle = scheduler.start();

        tokio::time::sleep(Duration::from_secs(60)).await;

        let status = scheduler.status().await;
        assert_eq!(status.runs_completed, 1);
        assert_eq!(status.state, SchedulerState::Armed);
        assert_eq!(status.next_run, Some(dt("2026-03-05 06:00:00")));

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_config_parks_the_scheduler() {
        let store = MemoryStore::new();
        store
            .save_review_config(ReviewConfig {
                enabled: false,
                ..ReviewConfig::default()
            })
            .await
            .unwrap();
        let clock = Arc::new(PausedClock::starting_at("2026-03-04 05:00:00"));
        let scheduler = build_scheduler(&store, clock, Arc::new(store.clone()));
        let handle = scheduler.start();

        // The loop exits on its own once it sees the disabled config.
        handle.await.unwrap();

        let status = scheduler.status().await;
        assert_eq!(status.state, SchedulerState::Disabled);
        assert_eq!(status.timers_armed, 0);
        assert_eq!(status.runs_completed, 0);
    }

    struct CountingFailingConfigStore {
        reads: AtomicU64,
    }

    #[async_trait]
    impl ConfigStore for CountingFailingConfigStore {
        async fn review_config(&self) -> Result<ReviewConfig, EngineError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::data_unavailable("config store down"))
        }

        async fn save_review_config(&self, _config: ReviewConfig) -> Result<(), EngineError> {
            Err(EngineError::data_unavailable("config store down"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn config_read_failure_retries_after_delay() {
        let store = MemoryStore::new();
        let config_store = Arc::new(CountingFailingConfigStore {
            reads: AtomicU64::new(0),
        });
        let clock = Arc::new(PausedClock::starting_at("2026-03-04 05:00:00"));
        let scheduler = build_scheduler(&store, clock, config_store.clone());
        let handle = scheduler.start();

        // Startup at 1s, then reads at 1s, 6s and 11s with the 5s retry.
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert!(config_store.reads.load(Ordering::SeqCst) >= 2);
        let status = scheduler.status().await;
        assert_ne!(status.state, SchedulerState::Disabled);
        assert_eq!(status.runs_completed, 0);
        assert_eq!(status.timers_armed, 0);

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_terminates_an_armed_loop() {
        let store = MemoryStore::new();
        // An hour to the default 06:00 review, so the loop is chaining
        // 40s segments when stop arrives.
        let clock = Arc::new(PausedClock::starting_at("2026-03-04 05:00:00"));
        let scheduler = build_scheduler(&store, clock, Arc::new(store.clone()));
        let handle = scheduler.start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        scheduler.stop();
        handle.await.unwrap();

        let status = scheduler.status().await;
        assert_eq!(status.runs_completed, 0);
    }
}
