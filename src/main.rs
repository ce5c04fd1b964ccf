use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use axum_server::tls_rustls::RustlsConfig;

use tally_core::calendar::ExclusionCalendar;
use tally_core::clock::{Clock, SystemClock};
use tally_core::dispatch::{DeliveryConfig, Dispatcher, SmtpMailer};
use tally_core::evaluate::ComplianceEvaluator;
use tally_core::model::{EngineError, ReviewConfig};
use tally_core::requirement::RequirementResolver;
use tally_core::review::{ReviewCoordinator, RunSummary};
use tally_core::schedule::{ReviewScheduler, SchedulerState};
use tally_core::store::{ConfigStore, MemoryStore};

// --- Error Handling ---

#[derive(Error, Debug)]
enum AppError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

// Map AppError to Axum's IntoResponse
impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        error!("Error occurred: {}", self); // Log the original error

        let (status_code, error_message) = match self {
            AppError::MissingEnvVar(ref _var) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error.".to_string(),
            ),
            AppError::TlsConfig(ref msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error (TLS Setup: {}). Check logs.", msg),
            ),
            // Invalid input on a config write is the caller's to fix, so the
            // detail goes back out. Everything else stays generic.
            AppError::Engine(EngineError::ConfigInvalid { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::Engine(EngineError::DataUnavailable { .. }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Required data is unavailable. Check logs.".to_string(),
            ),
            AppError::Engine(EngineError::DeliveryFailed { .. }) => (
                StatusCode::BAD_GATEWAY,
                "Notification delivery failed. Check logs.".to_string(),
            ),
            AppError::Engine(EngineError::ScheduleComputeFailed { .. }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error (Scheduling).".to_string(),
            ),
        };

        (
            status_code,
            Json(serde_json::json!({ "error": error_message })),
        )
            .into_response()
    }
}

// --- General App Configuration ---

#[derive(Debug, Clone)]
struct AppConfig {
    cert_path: String,
    key_path: String,
    smtp_host: String,
    smtp_from: String,
    org_scope: Option<String>,
}

fn load_app_config() -> Result<AppConfig, AppError> {
    Ok(AppConfig {
        cert_path: env::var("CERT_PATH")
            .map_err(|_| AppError::MissingEnvVar("CERT_PATH".into()))?,
        key_path: env::var("KEY_PATH").map_err(|_| AppError::MissingEnvVar("KEY_PATH".into()))?,
        smtp_host: env::var("SMTP_HOST")
            .map_err(|_| AppError::MissingEnvVar("SMTP_HOST".into()))?,
        smtp_from: env::var("SMTP_FROM")
            .map_err(|_| AppError::MissingEnvVar("SMTP_FROM".into()))?,
        org_scope: env::var("ORG_SCOPE").ok(),
    })
}

// --- Shared Application State ---

#[derive(Clone)]
struct AppState {
    coordinator: Arc<ReviewCoordinator>,
    scheduler: Arc<ReviewScheduler>,
    config_store: Arc<dyn ConfigStore>,
}

// --- Main Application Logic ---

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Setup ---
    dotenv::dotenv().ok();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let app_config = load_app_config()?;
    info!("App configuration loaded.");

    // --- Wire the Engine ---
    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let calendar = ExclusionCalendar::new(store.clone());
    let resolver = RequirementResolver::new(store.clone(), calendar.clone());
    let evaluator = ComplianceEvaluator::new(resolver, store.clone());

    let mailer = Arc::new(SmtpMailer::new(&app_config.smtp_from)?);
    let dispatcher = Arc::new(Dispatcher::new(
        DeliveryConfig::standard_ladder(&app_config.smtp_host),
        mailer,
    )?);

    let coordinator = Arc::new(ReviewCoordinator::new(
        store.clone(),
        store.clone(),
        calendar,
        evaluator,
        dispatcher,
        clock.clone(),
        app_config.org_scope.clone(),
    ));
    let scheduler = Arc::new(ReviewScheduler::new(
        coordinator.clone(),
        store.clone(),
        clock,
    ));
    let _scheduler_task = scheduler.start();
    info!("Review scheduler started.");

    let state = AppState {
        coordinator,
        scheduler,
        config_store: store,
    };
    info!("Application state initialized.");

    // --- Define Routes ---
    let review_routes = Router::new()
        .route("/run", post(handle_run_review))
        .route("/schedule", get(handle_schedule_status))
        .route("/config", get(handle_get_config).put(handle_put_config));
    let api_routes = Router::new().nest("/review", review_routes);

    let app = Router::new()
        .nest("/api", api_routes)
        .route("/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // --- Configure TLS ---
    let tls_config = match RustlsConfig::from_pem_file(
        PathBuf::from(&app_config.cert_path),
        PathBuf::from(&app_config.key_path),
    )
    .await
    {
        Ok(config) => config,
        Err(e) => {
            let err_msg = format!("Failed to load TLS cert/key: {}", e);
            error!("{}", err_msg);
            return Err(AppError::TlsConfig(err_msg).into());
        }
    };
    info!(
        "TLS configuration loaded successfully from {} and {}",
        app_config.cert_path, app_config.key_path
    );

    // --- Run Web Server ---
    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!("Starting server on https://{}", addr);
    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service())
        .await
        .context("HTTPS server failed")?;

    Ok(())
}

// --- Web Handlers ---

/// Manually triggers one review run and returns its summary.
async fn handle_run_review(State(state): State<AppState>) -> Json<RunSummary> {
    info!("Handling manual review trigger...");
    Json(state.coordinator.run_once().await)
}

#[derive(Serialize)]
struct ScheduleStatusResponse {
    enabled: bool,
    review_time: String,
    notification_recipients: Vec<String>,
    state: SchedulerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_run: Option<NaiveDateTime>,
    runs_completed: u64,
}

async fn handle_schedule_status(
    State(state): State<AppState>,
) -> Result<Json<ScheduleStatusResponse>, AppError> {
    let config = state.config_store.review_config().await?;
    let status = state.scheduler.status().await;
    Ok(Json(ScheduleStatusResponse {
        enabled: config.enabled,
        review_time: config.review_time,
        notification_recipients: config.notification_recipients,
        state: status.state,
        next_run: status.next_run,
        runs_completed: status.runs_completed,
    }))
}

async fn handle_get_config(State(state): State<AppState>) -> Result<Json<ReviewConfig>, AppError> {
    Ok(Json(state.config_store.review_config().await?))
}

/// Replaces the review configuration. The store validates before persisting,
/// so a malformed config is rejected with a 422 and the old one stays active.
async fn handle_put_config(
    State(state): State<AppState>,
    Json(config): Json<ReviewConfig>,
) -> Result<Json<ReviewConfig>, AppError> {
    state.config_store.save_review_config(config.clone()).await?;
    info!("Review configuration updated.");
    Ok(Json(config))
}

async fn handle_status(State(state): State<AppState>) -> Html<String> {
    info!("Handling /status request...");
    let status = state.scheduler.status().await;
    let next_run = status
        .next_run
        .map(|at| at.to_string())
        .unwrap_or_else(|| "none scheduled".to_string());
    let html_body = format!(
        "<h1>Server Status</h1><p>Current Time (Server): {}</p><p>Scheduler: {:?}, next run: {}</p><p>Completed review runs: {}</p>",
        chrono::Local::now().to_rfc3339(),
        status.state,
        next_run,
        status.runs_completed
    );
    Html(html_body)
}
