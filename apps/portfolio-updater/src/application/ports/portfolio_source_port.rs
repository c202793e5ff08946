//! Portfolio Source Port (Driven Port)
//!
//! Interface for fetching live portfolio snapshots from the backend.

use async_trait::async_trait;

use crate::domain::portfolio::{AccountId, FetchError, PortfolioSnapshot};

/// Port for fetching portfolio snapshots.
///
/// Implementations are expected to enforce their own request timeout; the
/// scheduler waits for every call to resolve.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortfolioSourcePort: Send + Sync {
    /// Fetch the current snapshot for one account.
    async fn fetch_snapshot(&self, account: &AccountId) -> Result<PortfolioSnapshot, FetchError>;
}
