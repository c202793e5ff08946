//! Portfolio Updater Binary
//!
//! Runs the update scheduler against the simulated portfolio source and logs
//! every snapshot it delivers.
//!
//! # Usage
//!
//! ```bash
//! PORTFOLIO_ACCOUNTS=ZX1234,ZX5678 cargo run --bin portfolio-updater
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `PORTFOLIO_ACCOUNTS`: Comma-separated account ids
//!
//! ## Optional
//! - `UPDATER_MARKET_INTERVAL_MS`: Refresh interval while open (default: 30000)
//! - `UPDATER_AFTER_HOURS_INTERVAL_MS`: Refresh interval while closed (default: 300000)
//! - `UPDATER_MAX_CONSECUTIVE_FAILURES`: Failures before shutdown (default: 5)
//! - `UPDATER_RETRY_DELAY_MS`: Reserved retry hint (default: 10000)
//! - `UPDATER_FETCH_MODE`: "sequential" | "concurrent" (default: sequential)
//! - `UPDATER_JITTER_FACTOR`: Delay jitter in [0, 1) (default: 0.0)
//! - `UPDATER_EXCHANGE`: "us" | "nse" (default: us)
//! - `UPDATER_HOLIDAYS`: Comma-separated YYYY-MM-DD closed dates
//! - `UPDATER_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `UPDATER_METRICS_ENABLED`: Record Prometheus metrics (default: true)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: portfolio-updater)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use portfolio_updater::infrastructure::health::{HealthServer, HealthServerState};
use portfolio_updater::infrastructure::telemetry;
use portfolio_updater::{
    SimulatedPortfolioSource, SimulatedSourceConfig, Subscriber, SubscriberId, Subscription,
    UpdateScheduler, UpdaterConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Portfolio Updater");

    let config = UpdaterConfig::from_env().context("invalid updater configuration")?;
    log_config(&config);

    if config.server.metrics_enabled {
        init_metrics().context("failed to install Prometheus recorder")?;
    }

    let shutdown_token = CancellationToken::new();

    let source = Arc::new(SimulatedPortfolioSource::new(
        &config.accounts,
        SimulatedSourceConfig::default(),
    ));

    let scheduler = UpdateScheduler::builder(source)
        .config(config.scheduler.clone())
        .oracle(config.oracle())
        .build()
        .context("invalid scheduler configuration")?;

    let _subscriptions: Vec<Subscription> = config
        .accounts
        .iter()
        .map(|account| {
            let id = SubscriberId::new(account.clone(), "log");
            scheduler.subscribe(logging_subscriber(id))
        })
        .collect();

    let market = scheduler.market_status();
    tracing::info!(
        open = market.is_open(),
        timezone = market.timezone_name(),
        next_open = ?market.next_open(),
        next_close = ?market.next_close(),
        "Market status"
    );

    scheduler.start();

    if config.server.health_port == 0 {
        tracing::info!("Health server disabled");
    } else {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            scheduler.clone(),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    tracing::info!("Portfolio updater ready");

    await_shutdown(shutdown_token).await;

    scheduler.stop();

    tracing::info!("Portfolio updater stopped");
    Ok(())
}

/// Subscriber that logs every snapshot and error it receives.
fn logging_subscriber(id: SubscriberId) -> Subscriber {
    Subscriber::new(id, |snapshot| {
        tracing::info!(
            account = %snapshot.account_id,
            total_value = %snapshot.total_value(),
            unrealized_pnl = %snapshot.unrealized_pnl(),
            holdings = snapshot.holdings.len(),
            "Portfolio updated"
        );
        Ok(())
    })
    .with_error_handler(|error| {
        if error.is_terminal() {
            tracing::error!(error = %error, "Portfolio updates halted");
        } else {
            tracing::warn!(error = %error, "Portfolio update failed");
        }
        Ok(())
    })
}

/// Log the parsed configuration.
fn log_config(config: &UpdaterConfig) {
    let millis = |d: std::time::Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        accounts = config.accounts.len(),
        exchange = config.exchange.as_str(),
        holidays = config.holidays.len(),
        fetch_mode = config.scheduler.fetch_mode.as_str(),
        market_interval_ms = millis(config.scheduler.market_hours_interval),
        after_hours_interval_ms = millis(config.scheduler.after_hours_interval),
        max_consecutive_failures = config.scheduler.max_consecutive_failures,
        health_port = config.server.health_port,
        metrics_enabled = config.server.metrics_enabled,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed, waiting indefinitely");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
