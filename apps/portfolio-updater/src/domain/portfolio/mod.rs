//! Portfolio Snapshot Types
//!
//! The payload the scheduler fetches and fans out. The scheduler itself never
//! looks inside a snapshot; these types exist so data sources, subscribers,
//! and the health endpoint share one representation.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Account Identity
// =============================================================================

/// Brokerage account identifier.
///
/// Independent of any widget observing it: several subscribers may share one
/// account, and the account is fetched once per cycle regardless.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create an account identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// A single position inside a portfolio snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    /// Trading symbol (e.g. `INFY`, `AAPL`).
    pub symbol: String,
    /// Units held. Negative for short positions.
    pub quantity: Decimal,
    /// Average acquisition price per unit.
    pub average_price: Decimal,
    /// Most recent traded price per unit.
    pub last_price: Decimal,
}

impl Holding {
    /// Current market value of the position.
    #[must_use]
    pub fn market_value(&self) -> Decimal {
        self.quantity * self.last_price
    }

    /// Unrealized profit or loss against the average price.
    #[must_use]
    pub fn unrealized_pnl(&self) -> Decimal {
        self.quantity * (self.last_price - self.average_price)
    }
}

/// Point-in-time view of one account's portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    /// Account this snapshot belongs to.
    pub account_id: AccountId,
    /// Uninvested cash balance.
    pub cash: Decimal,
    /// Open positions.
    pub holdings: Vec<Holding>,
    /// When the data source produced the snapshot.
    pub fetched_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    /// Create an empty snapshot (cash only).
    #[must_use]
    pub const fn new(account_id: AccountId, cash: Decimal, fetched_at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            cash,
            holdings: Vec::new(),
            fetched_at,
        }
    }

    /// Add a holding, builder style.
    #[must_use]
    pub fn with_holding(mut self, holding: Holding) -> Self {
        self.holdings.push(holding);
        self
    }

    /// Sum of all position market values.
    #[must_use]
    pub fn invested_value(&self) -> Decimal {
        self.holdings.iter().map(Holding::market_value).sum()
    }

    /// Cash plus invested value.
    #[must_use]
    pub fn total_value(&self) -> Decimal {
        self.cash + self.invested_value()
    }

    /// Sum of unrealized profit and loss across positions.
    #[must_use]
    pub fn unrealized_pnl(&self) -> Decimal {
        self.holdings.iter().map(Holding::unrealized_pnl).sum()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure reported by a portfolio data source for one account.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The backend could not be reached or returned no data.
    #[error("portfolio backend unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer in time.
    #[error("portfolio fetch timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The backend does not know this account.
    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),
    /// The backend answered with an error status.
    #[error("portfolio backend rejected request ({status}): {message}")]
    Rejected {
        /// Status code reported by the backend.
        status: u16,
        /// Message reported by the backend.
        message: String,
    },
}
