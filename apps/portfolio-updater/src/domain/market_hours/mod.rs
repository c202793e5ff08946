//! Market Hours Oracle
//!
//! Pure function of the current instant to "is the exchange open, and when
//! does that change". Used by the scheduler to pick between its market-hours
//! and after-hours refresh intervals.
//!
//! # Rules
//!
//! - The instant is converted to the exchange's reference timezone.
//! - Non-trading days come from a [`TradingCalendar`]. The default
//!   [`WeekendCalendar`] closes Saturday and Sunday only; [`HolidayCalendar`]
//!   additionally closes a fixed set of dates.
//! - On a trading day the market is open for `open <= time < close`.
//! - When closed, the next open is today's open if `time < open`, otherwise
//!   the following day's, advanced past non-trading days.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// Upper bound on days scanned when searching for the next trading day.
///
/// The weekend-only calendar never needs more than two skips; the bound only
/// matters for holiday calendars.
pub const MAX_CALENDAR_SCAN_DAYS: u32 = 366;

const fn session_time(hour: u32, minute: u32) -> NaiveTime {
    match NaiveTime::from_hms_opt(hour, minute, 0) {
        Some(time) => time,
        None => panic!("invalid session time"),
    }
}

const US_OPEN: NaiveTime = session_time(9, 30);
const US_CLOSE: NaiveTime = session_time(16, 0);
const NSE_OPEN: NaiveTime = session_time(9, 15);
const NSE_CLOSE: NaiveTime = session_time(15, 30);

// =============================================================================
// Calendars
// =============================================================================

/// Decides which calendar dates (in the exchange timezone) are trading days.
pub trait TradingCalendar: Send + Sync + fmt::Debug {
    /// Whether the exchange holds a regular session on `date`.
    fn is_trading_day(&self, date: NaiveDate) -> bool;
}

/// Saturday and Sunday closed, every other day open.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeekendCalendar;

impl TradingCalendar for WeekendCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date.weekday())
    }
}

/// Weekends plus an explicit set of exchange holidays.
#[derive(Debug, Clone, Default)]
pub struct HolidayCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl HolidayCalendar {
    /// Create a calendar closing the given dates in addition to weekends.
    #[must_use]
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Whether `date` is one of the configured holidays.
    #[must_use]
    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    /// Number of configured holidays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.holidays.len()
    }

    /// Whether no holidays are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holidays.is_empty()
    }
}

impl TradingCalendar for HolidayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date.weekday()) && !self.is_holiday(date)
    }
}

const fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

// =============================================================================
// Session
// =============================================================================

/// Regular trading window of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketSession {
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl MarketSession {
    /// Create a session. `open` must be strictly before `close`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidWindow`] for an empty or inverted window.
    pub fn new(timezone: Tz, open: NaiveTime, close: NaiveTime) -> Result<Self, SessionError> {
        if open >= close {
            return Err(SessionError::InvalidWindow { open, close });
        }
        Ok(Self {
            timezone,
            open,
            close,
        })
    }

    /// US equities: 09:30-16:00 America/New_York.
    #[must_use]
    pub const fn us_equities() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            open: US_OPEN,
            close: US_CLOSE,
        }
    }

    /// NSE cash market: 09:15-15:30 Asia/Kolkata.
    #[must_use]
    pub const fn nse() -> Self {
        Self {
            timezone: chrono_tz::Asia::Kolkata,
            open: NSE_OPEN,
            close: NSE_CLOSE,
        }
    }

    /// Exchange reference timezone.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Local opening time.
    #[must_use]
    pub const fn open(&self) -> NaiveTime {
        self.open
    }

    /// Local closing time.
    #[must_use]
    pub const fn close(&self) -> NaiveTime {
        self.close
    }

    fn contains(&self, time: NaiveTime) -> bool {
        self.open <= time && time < self.close
    }

    /// Resolve a local wall-clock time on `date` to an absolute instant.
    ///
    /// Ambiguous times take the earlier instant; times inside a DST gap are
    /// shifted forward by an hour.
    fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + TimeDelta::hours(1)))
                    .earliest()
            })
            .map_or_else(|| naive.and_utc(), |local| local.with_timezone(&Utc))
    }
}

impl Default for MarketSession {
    fn default() -> Self {
        Self::us_equities()
    }
}

/// Invalid session definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Opening time is not before closing time.
    #[error("session open {open} must be before close {close}")]
    InvalidWindow {
        /// Requested opening time.
        open: NaiveTime,
        /// Requested closing time.
        close: NaiveTime,
    },
}

// =============================================================================
// Market Hours
// =============================================================================

/// Open/closed state with the instant of the next transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    /// Regular session in progress.
    Open {
        /// When today's session ends.
        next_close: DateTime<Utc>,
    },
    /// Outside the regular session.
    Closed {
        /// When the next session begins.
        next_open: DateTime<Utc>,
    },
}

/// Market state at one point in time. Produced fresh per evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketHours {
    /// Open/closed with the next transition.
    pub status: MarketStatus,
    /// Exchange reference timezone.
    pub timezone: Tz,
}

impl MarketHours {
    /// Whether the regular session is in progress.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.status, MarketStatus::Open { .. })
    }

    /// Next session start; present only while closed.
    #[must_use]
    pub const fn next_open(&self) -> Option<DateTime<Utc>> {
        match self.status {
            MarketStatus::Closed { next_open } => Some(next_open),
            MarketStatus::Open { .. } => None,
        }
    }

    /// Current session end; present only while open.
    #[must_use]
    pub const fn next_close(&self) -> Option<DateTime<Utc>> {
        match self.status {
            MarketStatus::Open { next_close } => Some(next_close),
            MarketStatus::Closed { .. } => None,
        }
    }

    /// IANA name of the exchange timezone.
    #[must_use]
    pub fn timezone_name(&self) -> &'static str {
        self.timezone.name()
    }
}

// =============================================================================
// Oracle
// =============================================================================

/// Evaluates [`MarketHours`] for a session and calendar.
///
/// Stateless after construction; safe to share across tasks.
///
/// # Example
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use chrono_tz::America::New_York;
/// use portfolio_updater::domain::market_hours::MarketHoursOracle;
///
/// let oracle = MarketHoursOracle::default();
/// let monday_10am = New_York
///     .with_ymd_and_hms(2024, 1, 8, 10, 0, 0)
///     .unwrap()
///     .with_timezone(&Utc);
///
/// let hours = oracle.evaluate(monday_10am);
/// assert!(hours.is_open());
/// assert!(hours.next_open().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct MarketHoursOracle {
    session: MarketSession,
    calendar: Arc<dyn TradingCalendar>,
}

impl Default for MarketHoursOracle {
    fn default() -> Self {
        Self::new(MarketSession::default())
    }
}

impl MarketHoursOracle {
    /// Create an oracle with the weekend-only calendar.
    #[must_use]
    pub fn new(session: MarketSession) -> Self {
        Self {
            session,
            calendar: Arc::new(WeekendCalendar),
        }
    }

    /// Replace the trading calendar.
    #[must_use]
    pub fn with_calendar(mut self, calendar: impl TradingCalendar + 'static) -> Self {
        self.calendar = Arc::new(calendar);
        self
    }

    /// The session this oracle evaluates.
    #[must_use]
    pub const fn session(&self) -> &MarketSession {
        &self.session
    }

    /// Evaluate market state at `now`.
    #[must_use]
    pub fn evaluate(&self, now: DateTime<Utc>) -> MarketHours {
        let timezone = self.session.timezone;
        let local = now.with_timezone(&timezone);
        let today = local.date_naive();
        let time = local.time();

        if self.calendar.is_trading_day(today) && self.session.contains(time) {
            return MarketHours {
                status: MarketStatus::Open {
                    next_close: self.session.at(today, self.session.close),
                },
                timezone,
            };
        }

        let mut day = if time >= self.session.open {
            next_day(today)
        } else {
            today
        };
        for _ in 0..MAX_CALENDAR_SCAN_DAYS {
            if self.calendar.is_trading_day(day) {
                break;
            }
            day = next_day(day);
        }

        MarketHours {
            status: MarketStatus::Closed {
                next_open: self.session.at(day, self.session.open),
            },
            timezone,
        }
    }
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}
