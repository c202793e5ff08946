//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for scheduler status, market status, and Prometheus metrics.
//! Used by container orchestrators and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON scheduler status (503 while stopped)
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /market` - Returns JSON market open/closed status
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::scheduler::{SchedulerConfig, SchedulerStats, UpdateScheduler};
use crate::domain::market_hours::MarketHours;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Scheduler state.
    pub scheduler: SchedulerStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Running with no outstanding failures.
    Healthy,
    /// Running but recent fetches failed.
    Degraded,
    /// Not running.
    Unhealthy,
}

/// Scheduler state as reported over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Whether the scheduler is running.
    pub running: bool,
    /// Current phase name.
    pub phase: &'static str,
    /// Registered subscribers.
    pub subscriber_count: usize,
    /// Distinct accounts polled.
    pub account_count: usize,
    /// Most recent successful fetch.
    pub last_update: Option<DateTime<Utc>>,
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
    /// Cycles completed since startup.
    pub cycles_completed: u64,
    /// Active configuration.
    pub config: ConfigStatus,
}

/// Scheduler configuration with durations in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatus {
    /// Delay between cycles while the market is open.
    pub market_hours_interval_ms: u64,
    /// Delay between cycles while the market is closed.
    pub after_hours_interval_ms: u64,
    /// Consecutive failures that stop the scheduler.
    pub max_consecutive_failures: u32,
    /// Reserved retry hint.
    pub retry_delay_ms: u64,
    /// Fetch mode name.
    pub fetch_mode: &'static str,
    /// Delay jitter factor.
    pub jitter_factor: f64,
}

/// Market status response.
#[derive(Debug, Clone, Serialize)]
pub struct MarketResponse {
    /// Whether the market is open now.
    pub open: bool,
    /// Exchange timezone.
    pub timezone: &'static str,
    /// Next open, when closed.
    pub next_open: Option<DateTime<Utc>>,
    /// Next close, when open.
    pub next_close: Option<DateTime<Utc>>,
}

impl From<MarketHours> for MarketResponse {
    fn from(hours: MarketHours) -> Self {
        Self {
            open: hours.is_open(),
            timezone: hours.timezone_name(),
            next_open: hours.next_open(),
            next_close: hours.next_close(),
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    scheduler: UpdateScheduler,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, scheduler: UpdateScheduler) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            scheduler,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Build the HTTP router.
    #[must_use]
    pub fn router(state: Arc<HealthServerState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/market", get(market_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Self::router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn market_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(MarketResponse::from(state.scheduler.market_status()))
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::NOT_FOUND,
                [("content-type", "text/plain")],
                "Metrics disabled".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let stats = state.scheduler.stats();

    HealthResponse {
        status: determine_health_status(&stats),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        scheduler: scheduler_status(&stats),
    }
}

fn scheduler_status(stats: &SchedulerStats) -> SchedulerStatus {
    SchedulerStatus {
        running: stats.running,
        phase: stats.phase.as_str(),
        subscriber_count: stats.subscriber_count,
        account_count: stats.account_count,
        last_update: stats.last_update,
        consecutive_failures: stats.consecutive_failures,
        cycles_completed: stats.cycles_completed,
        config: config_status(&stats.config),
    }
}

fn config_status(config: &SchedulerConfig) -> ConfigStatus {
    ConfigStatus {
        market_hours_interval_ms: millis(config.market_hours_interval),
        after_hours_interval_ms: millis(config.after_hours_interval),
        max_consecutive_failures: config.max_consecutive_failures,
        retry_delay_ms: millis(config.retry_delay),
        fetch_mode: config.fetch_mode.as_str(),
        jitter_factor: config.jitter_factor,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

const fn determine_health_status(stats: &SchedulerStats) -> HealthStatus {
    if !stats.running {
        HealthStatus::Unhealthy
    } else if stats.consecutive_failures > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    use super::*;
    use crate::application::services::scheduler::SchedulerPhase;
    use crate::domain::market_hours::MarketHoursOracle;

    fn stats(running: bool, consecutive_failures: u32) -> SchedulerStats {
        SchedulerStats {
            running,
            phase: if running {
                SchedulerPhase::Armed
            } else {
                SchedulerPhase::Stopped
            },
            subscriber_count: 2,
            account_count: 1,
            last_update: None,
            consecutive_failures,
            cycles_completed: 7,
            config: SchedulerConfig::default(),
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_running() {
        assert_eq!(determine_health_status(&stats(true, 0)), HealthStatus::Healthy);
        assert_eq!(determine_health_status(&stats(true, 2)), HealthStatus::Degraded);
    }

    #[test]
    fn determine_status_stopped() {
        assert_eq!(
            determine_health_status(&stats(false, 0)),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn config_reported_in_millis() {
        let status = scheduler_status(&stats(true, 0));
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["phase"], "armed");
        assert_eq!(json["cycles_completed"], 7);
        assert_eq!(json["config"]["market_hours_interval_ms"], 30_000);
        assert_eq!(json["config"]["after_hours_interval_ms"], 300_000);
        assert_eq!(json["config"]["retry_delay_ms"], 10_000);
        assert_eq!(json["config"]["fetch_mode"], "sequential");
    }

    #[test]
    fn market_response_from_closed_hours() {
        let saturday = New_York
            .with_ymd_and_hms(2024, 1, 13, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let response = MarketResponse::from(MarketHoursOracle::default().evaluate(saturday));

        assert!(!response.open);
        assert_eq!(response.timezone, "America/New_York");
        assert!(response.next_open.is_some());
        assert!(response.next_close.is_none());
    }
}
