//! Prometheus Metrics Module
//!
//! Exposes scheduler metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Cycles**: Completed update cycles and budget exhaustion
//! - **Fetches**: Data source outcomes and latency
//! - **Callbacks**: Subscriber handler failures
//! - **State**: Running flag, subscriber count, consecutive failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first.
///
/// # Errors
///
/// Returns [`BuildError`] if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "portfolio_updater_cycles_total",
        "Total update cycles completed"
    );
    describe_counter!(
        "portfolio_updater_fetches_total",
        "Total portfolio fetches by outcome"
    );
    describe_counter!(
        "portfolio_updater_callback_failures_total",
        "Total subscriber handler failures by handler kind"
    );
    describe_counter!(
        "portfolio_updater_budget_exhausted_total",
        "Times the scheduler stopped after exhausting its error budget"
    );

    describe_gauge!(
        "portfolio_updater_subscribers",
        "Number of registered subscribers"
    );
    describe_gauge!(
        "portfolio_updater_running",
        "1 while the scheduler is running, 0 otherwise"
    );
    describe_gauge!(
        "portfolio_updater_consecutive_failures",
        "Current consecutive fetch failure count"
    );

    describe_histogram!(
        "portfolio_updater_fetch_duration_seconds",
        "Time spent in a single portfolio fetch"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for subscriber handler kinds.
#[derive(Debug, Clone, Copy)]
pub enum CallbackKind {
    /// Snapshot handler.
    Update,
    /// Error handler.
    Error,
}

impl CallbackKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Error => "error",
        }
    }
}

const fn fetch_outcome(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}

/// Record a completed update cycle.
pub fn record_cycle() {
    counter!("portfolio_updater_cycles_total").increment(1);
}

/// Record one data source fetch and its latency.
pub fn record_fetch(success: bool, duration: Duration) {
    counter!(
        "portfolio_updater_fetches_total",
        "outcome" => fetch_outcome(success)
    )
    .increment(1);
    histogram!("portfolio_updater_fetch_duration_seconds").record(duration.as_secs_f64());
}

/// Record a subscriber handler that failed or panicked.
pub fn record_callback_failure(kind: CallbackKind) {
    counter!(
        "portfolio_updater_callback_failures_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a stop caused by the error budget.
pub fn record_budget_exhausted() {
    counter!("portfolio_updater_budget_exhausted_total").increment(1);
}

/// Update the subscriber count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribers(count: usize) {
    gauge!("portfolio_updater_subscribers").set(count as f64);
}

/// Update the running flag.
pub fn set_running(running: bool) {
    gauge!("portfolio_updater_running").set(if running { 1.0 } else { 0.0 });
}

/// Update the consecutive failure count.
pub fn set_consecutive_failures(failures: u32) {
    gauge!("portfolio_updater_consecutive_failures").set(f64::from(failures));
}

// =============================================================================
// Tests
// =============================================================================
