//! Simulated Portfolio Source
//!
//! Serves seeded portfolios from memory. Each successful fetch moves every
//! holding's last price by a random step of at most `max_step_bps` basis
//! points, so subscribers see values change between cycles.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;

use crate::application::ports::PortfolioSourcePort;
use crate::domain::portfolio::{AccountId, FetchError, Holding, PortfolioSnapshot};

/// Seed positions: symbol, quantity, average price (cents), last price (cents).
const SEED_HOLDINGS: [(&str, i64, i64, i64); 4] = [
    ("AAPL", 40, 17_250, 18_950),
    ("MSFT", 15, 38_010, 41_020),
    ("NVDA", 8, 61_500, 87_530),
    ("SPY", 20, 47_800, 51_210),
];

/// Seed cash balance in cents.
const SEED_CASH_CENTS: i64 = 2_500_000;

/// Simulated source configuration.
#[derive(Debug, Clone)]
pub struct SimulatedSourceConfig {
    /// Artificial latency per fetch.
    pub latency: Duration,
    /// Fetches taking longer than this fail with [`FetchError::Timeout`].
    pub timeout: Duration,
    /// Probability in `[0, 1]` that a fetch fails as unavailable.
    pub failure_rate: f64,
    /// Largest price move per fetch, in basis points.
    pub max_step_bps: i64,
}

impl Default for SimulatedSourceConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
            failure_rate: 0.0,
            max_step_bps: 25,
        }
    }
}

/// In-memory [`PortfolioSourcePort`] with random-walk prices.
#[derive(Debug)]
pub struct SimulatedPortfolioSource {
    config: SimulatedSourceConfig,
    portfolios: Mutex<BTreeMap<AccountId, PortfolioSnapshot>>,
}

impl SimulatedPortfolioSource {
    /// Create a source with the same seed portfolio for every account.
    #[must_use]
    pub fn new(accounts: &[AccountId], config: SimulatedSourceConfig) -> Self {
        let portfolios = accounts
            .iter()
            .map(|account| (account.clone(), seed_portfolio(account)))
            .collect();

        Self {
            config: SimulatedSourceConfig {
                failure_rate: config.failure_rate.clamp(0.0, 1.0),
                max_step_bps: config.max_step_bps.abs(),
                ..config
            },
            portfolios: Mutex::new(portfolios),
        }
    }

    /// Replace one account's portfolio.
    pub fn insert(&self, snapshot: PortfolioSnapshot) {
        self.portfolios
            .lock()
            .insert(snapshot.account_id.clone(), snapshot);
    }

    /// Number of known accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.portfolios.lock().len()
    }

    /// Whether no accounts are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.portfolios.lock().is_empty()
    }

    fn next_snapshot(&self, account: &AccountId) -> Result<PortfolioSnapshot, FetchError> {
        let mut rng = rand::rng();
        if rng.random_bool(self.config.failure_rate) {
            return Err(FetchError::Unavailable("simulated outage".to_string()));
        }

        let mut portfolios = self.portfolios.lock();
        let snapshot = portfolios
            .get_mut(account)
            .ok_or_else(|| FetchError::UnknownAccount(account.clone()))?;

        let max_step = self.config.max_step_bps;
        for holding in &mut snapshot.holdings {
            let step_bps = rng.random_range(-max_step..=max_step);
            let moved = holding.last_price * (Decimal::ONE + Decimal::new(step_bps, 4));
            holding.last_price = moved.round_dp(2).max(Decimal::new(1, 2));
        }
        snapshot.fetched_at = Utc::now();

        Ok(snapshot.clone())
    }
}

#[async_trait]
impl PortfolioSourcePort for SimulatedPortfolioSource {
    async fn fetch_snapshot(&self, account: &AccountId) -> Result<PortfolioSnapshot, FetchError> {
        if self.config.latency >= self.config.timeout {
            tokio::time::sleep(self.config.timeout).await;
            return Err(FetchError::Timeout(self.config.timeout));
        }
        tokio::time::sleep(self.config.latency).await;

        let result = self.next_snapshot(account);
        if let Err(error) = &result {
            tracing::debug!(account = %account, error = %error, "Simulated fetch failed");
        }
        result
    }
}

fn seed_portfolio(account: &AccountId) -> PortfolioSnapshot {
    SEED_HOLDINGS.iter().fold(
        PortfolioSnapshot::new(account.clone(), Decimal::new(SEED_CASH_CENTS, 2), Utc::now()),
        |snapshot, &(symbol, quantity, average_cents, last_cents)| {
            snapshot.with_holding(Holding {
                symbol: symbol.to_string(),
                quantity: Decimal::from(quantity),
                average_price: Decimal::new(average_cents, 2),
                last_price: Decimal::new(last_cents, 2),
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_config() -> SimulatedSourceConfig {
        SimulatedSourceConfig {
            latency: Duration::ZERO,
            ..SimulatedSourceConfig::default()
        }
    }

    #[tokio::test]
    async fn known_account_returns_seeded_portfolio() {
        let account = AccountId::from("ZX1234");
        let source = SimulatedPortfolioSource::new(&[account.clone()], instant_config());

        let snapshot = source.fetch_snapshot(&account).await.unwrap();

        assert_eq!(snapshot.account_id, account);
        assert_eq!(snapshot.holdings.len(), SEED_HOLDINGS.len());
        assert_eq!(snapshot.cash, Decimal::new(SEED_CASH_CENTS, 2));
        assert!(snapshot.total_value() > snapshot.cash);
    }

    #[tokio::test]
    async fn unknown_account_rejected() {
        let source = SimulatedPortfolioSource::new(&[AccountId::from("A")], instant_config());

        let result = source.fetch_snapshot(&AccountId::from("B")).await;

        assert_eq!(result, Err(FetchError::UnknownAccount(AccountId::from("B"))));
    }

    #[tokio::test]
    async fn prices_drift_within_step() {
        let account = AccountId::from("A");
        let source = SimulatedPortfolioSource::new(&[account.clone()], instant_config());
        let before = source.fetch_snapshot(&account).await.unwrap();

        let after = source.fetch_snapshot(&account).await.unwrap();

        for (old, new) in before.holdings.iter().zip(&after.holdings) {
            let limit = old.last_price * Decimal::new(25, 4) + Decimal::new(1, 2);
            assert!((new.last_price - old.last_price).abs() <= limit);
            assert!(new.last_price > Decimal::ZERO);
        }
    }

    #[tokio::test]
    async fn failure_rate_one_always_fails() {
        let account = AccountId::from("A");
        let source = SimulatedPortfolioSource::new(
            &[account.clone()],
            SimulatedSourceConfig {
                failure_rate: 7.0,
                ..instant_config()
            },
        );

        for _ in 0..5 {
            assert!(matches!(
                source.fetch_snapshot(&account).await,
                Err(FetchError::Unavailable(_))
            ));
        }
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let account = AccountId::from("A");
        let source = SimulatedPortfolioSource::new(
            &[account.clone()],
            SimulatedSourceConfig {
                latency: Duration::from_millis(50),
                timeout: Duration::from_millis(10),
                ..SimulatedSourceConfig::default()
            },
        );

        assert_eq!(
            source.fetch_snapshot(&account).await,
            Err(FetchError::Timeout(Duration::from_millis(10)))
        );
    }

    #[test]
    fn insert_replaces_portfolio() {
        let source = SimulatedPortfolioSource::new(&[], instant_config());
        assert!(source.is_empty());

        source.insert(PortfolioSnapshot::new(
            AccountId::from("C"),
            Decimal::ONE,
            Utc::now(),
        ));
        assert_eq!(source.len(), 1);
    }
}
