#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Portfolio Updater - Market-Hours Aware Portfolio Refresh
//!
//! Keeps portfolio snapshots fresh for every account with at least one
//! subscriber. Polls fast while the exchange session is open, slowly while it
//! is closed, and shuts itself down when nobody is listening or the data
//! source keeps failing.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and rules
//!   - `portfolio`: Accounts, holdings, snapshots
//!   - `market_hours`: Sessions, calendars, the market hours oracle
//!   - `subscription`: Subscriber identities and the registry
//!   - `error_budget`: Consecutive-failure accounting
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Portfolio source and clock interfaces
//!   - `services`: The update scheduler
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `config`: Environment configuration
//!   - `sources`: Portfolio source implementations
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing subscriber and OTLP export
//!
//! # Data Flow
//!
//! ```text
//!                  ┌──────────────┐
//!  MarketHours ───►│              │  fetch_snapshot   ┌────────────────┐
//!  Oracle          │   Update     │──────────────────►│ Portfolio      │
//!                  │   Scheduler  │◄──────────────────│ Source         │
//!  Subscriber ────►│              │                   └────────────────┘
//!  Registry        └──────┬───────┘
//!                         │ on_update / on_error
//!              ┌──────────┼──────────┐
//!              ▼          ▼          ▼
//!          ACC_list   ACC_chart   OTHER_list
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::error_budget::ErrorBudget;
pub use domain::market_hours::{
    HolidayCalendar, MarketHours, MarketHoursOracle, MarketSession, MarketStatus,
    TradingCalendar, WeekendCalendar,
};
pub use domain::portfolio::{AccountId, FetchError, Holding, PortfolioSnapshot};
pub use domain::subscription::{
    CallbackError, IdentityError, Subscriber, SubscriberId, SubscriberRegistry, UpdateError,
};

// Ports
pub use application::ports::{ClockPort, FixedClock, PortfolioSourcePort, SystemClock};

// Scheduler
pub use application::services::scheduler::{
    FetchMode, SchedulerConfig, SchedulerConfigError, SchedulerPhase, SchedulerStats,
    Subscription, UpdateScheduler,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Exchange, ServerSettings, UpdaterConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Sources
pub use infrastructure::sources::{SimulatedPortfolioSource, SimulatedSourceConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
