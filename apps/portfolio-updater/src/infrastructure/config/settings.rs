//! Updater Configuration Settings
//!
//! Configuration types for the portfolio updater, loaded from environment
//! variables.

use std::time::Duration;

use chrono::NaiveDate;

use crate::application::services::scheduler::{FetchMode, SchedulerConfig, SchedulerConfigError};
use crate::domain::market_hours::{HolidayCalendar, MarketHoursOracle, MarketSession};
use crate::domain::portfolio::AccountId;

/// Exchange whose session drives the update cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exchange {
    /// US equities (NYSE/Nasdaq regular session).
    #[default]
    Us,
    /// National Stock Exchange of India.
    Nse,
}

impl Exchange {
    /// Parse exchange from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "nse" => Self::Nse,
            _ => Self::Us,
        }
    }

    /// Get the exchange name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Us => "us",
            Self::Nse => "nse",
        }
    }

    /// Regular trading session for this exchange.
    #[must_use]
    pub const fn session(&self) -> MarketSession {
        match self {
            Self::Us => MarketSession::us_equities(),
            Self::Nse => MarketSession::nse(),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
    /// Whether Prometheus metrics are recorded and served.
    pub metrics_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            metrics_enabled: true,
        }
    }
}

/// Complete updater configuration.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Accounts the binary subscribes to at startup.
    pub accounts: Vec<AccountId>,
    /// Exchange session.
    pub exchange: Exchange,
    /// Additional closed dates on top of weekends.
    pub holidays: Vec<NaiveDate>,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Server settings.
    pub server: ServerSettings,
}

impl UpdaterConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `PORTFOLIO_ACCOUNTS` is missing or empty, a holiday
    /// date is malformed, or the scheduler settings are invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`UpdaterConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_accounts = lookup("PORTFOLIO_ACCOUNTS")
            .ok_or_else(|| ConfigError::MissingEnvVar("PORTFOLIO_ACCOUNTS".to_string()))?;
        let accounts: Vec<AccountId> = split_list(&raw_accounts).map(AccountId::new).collect();
        if accounts.is_empty() {
            return Err(ConfigError::EmptyValue("PORTFOLIO_ACCOUNTS".to_string()));
        }

        let exchange = lookup("UPDATER_EXCHANGE")
            .map(|s| Exchange::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let holidays = lookup("UPDATER_HOLIDAYS")
            .map(|raw| parse_holidays(&raw))
            .transpose()?
            .unwrap_or_default();

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            market_hours_interval: parse_duration_millis(
                &lookup,
                "UPDATER_MARKET_INTERVAL_MS",
                defaults.market_hours_interval,
            ),
            after_hours_interval: parse_duration_millis(
                &lookup,
                "UPDATER_AFTER_HOURS_INTERVAL_MS",
                defaults.after_hours_interval,
            ),
            max_consecutive_failures: parse_or(
                &lookup,
                "UPDATER_MAX_CONSECUTIVE_FAILURES",
                defaults.max_consecutive_failures,
            ),
            retry_delay: parse_duration_millis(
                &lookup,
                "UPDATER_RETRY_DELAY_MS",
                defaults.retry_delay,
            ),
            fetch_mode: lookup("UPDATER_FETCH_MODE")
                .map(|s| FetchMode::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            jitter_factor: parse_or(&lookup, "UPDATER_JITTER_FACTOR", defaults.jitter_factor),
        };
        scheduler.validate()?;

        let server = ServerSettings {
            health_port: parse_or(
                &lookup,
                "UPDATER_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
            metrics_enabled: lookup("UPDATER_METRICS_ENABLED")
                .map_or(ServerSettings::default().metrics_enabled, |v| parse_bool(&v)),
        };

        Ok(Self {
            accounts,
            exchange,
            holidays,
            scheduler,
            server,
        })
    }

    /// Market hours oracle for the configured exchange and holidays.
    #[must_use]
    pub fn oracle(&self) -> MarketHoursOracle {
        let oracle = MarketHoursOracle::new(self.exchange.session());
        if self.holidays.is_empty() {
            oracle
        } else {
            oracle.with_calendar(HolidayCalendar::new(self.holidays.iter().copied()))
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Holiday entry is not a `YYYY-MM-DD` date.
    #[error("invalid holiday date '{value}': {source}")]
    InvalidHoliday {
        /// Offending entry.
        value: String,
        /// Parse failure.
        source: chrono::ParseError,
    },
    /// Scheduler settings were rejected.
    #[error(transparent)]
    Scheduler(#[from] SchedulerConfigError),
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_holidays(raw: &str) -> Result<Vec<NaiveDate>, ConfigError> {
    split_list(raw)
        .map(|value| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|source| {
                ConfigError::InvalidHoliday {
                    value: value.to_string(),
                    source,
                }
            })
        })
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
