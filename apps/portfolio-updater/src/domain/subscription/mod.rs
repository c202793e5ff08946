//! Subscriber Registry
//!
//! Tracks which dashboard components want live portfolio data and for which
//! accounts.
//!
//! # Design
//!
//! Each subscriber has a structured identity: the account it observes plus a
//! component discriminator. The registry indexes entries by account, so the
//! set of accounts to poll is simply the set of index keys and fan-out is a
//! single map lookup.
//!
//! Registrations carry a random token. Revoking with a stale token (the
//! identity was re-registered since) leaves the newer entry untouched, which
//! makes revocation idempotent.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::portfolio::{AccountId, FetchError, PortfolioSnapshot};

/// Separator between account and component in legacy string identities.
pub const IDENTITY_SEPARATOR: char = '_';

// =============================================================================
// Identity
// =============================================================================

/// Identity of one observer: the account it watches and which component it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId {
    account_id: AccountId,
    component_id: String,
}

impl SubscriberId {
    /// Create an identity from its parts.
    #[must_use]
    pub fn new(account_id: impl Into<AccountId>, component_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            component_id: component_id.into(),
        }
    }

    /// Parse a legacy `"<account>_<component>"` identity.
    ///
    /// Splits at the first separator, so the component part may itself
    /// contain separators.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the separator is missing or the account
    /// part is empty.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let Some((account, component)) = raw.split_once(IDENTITY_SEPARATOR) else {
            return Err(IdentityError::MissingSeparator(raw.to_string()));
        };
        if account.is_empty() {
            return Err(IdentityError::EmptyAccount(raw.to_string()));
        }
        Ok(Self::new(account, component))
    }

    /// The observed account.
    #[must_use]
    pub const fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// The component discriminator.
    #[must_use]
    pub fn component_id(&self) -> &str {
        &self.component_id
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{IDENTITY_SEPARATOR}{}",
            self.account_id, self.component_id
        )
    }
}

impl FromStr for SubscriberId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Malformed legacy identity string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// No separator between account and component.
    #[error("subscriber identity {0:?} has no '_' separator")]
    MissingSeparator(String),
    /// Nothing before the separator.
    #[error("subscriber identity {0:?} has an empty account part")]
    EmptyAccount(String),
}

// =============================================================================
// Errors delivered to subscribers
// =============================================================================

/// Error delivered to a subscriber's error handler (and to `force_update`
/// callers).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// The data source failed for this account.
    #[error("failed to fetch portfolio for account {account}: {source}")]
    Fetch {
        /// Account whose fetch failed.
        account: AccountId,
        /// Underlying data source failure.
        source: FetchError,
    },
    /// Too many consecutive failures; the scheduler has stopped.
    #[error("portfolio updates stopped after {failures} consecutive failures")]
    BudgetExhausted {
        /// Consecutive failures at the time of shutdown.
        failures: u32,
    },
    /// This subscriber's own update handler failed.
    #[error("update handler for {subscriber} failed: {reason}")]
    Callback {
        /// Subscriber whose handler failed.
        subscriber: SubscriberId,
        /// Failure description.
        reason: String,
    },
}

impl UpdateError {
    /// Whether this error means the scheduler has shut down.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::BudgetExhausted { .. })
    }
}

/// Failure raised by a subscriber callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(String);

impl CallbackError {
    /// Create a callback error with a description.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    /// The failure description.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallbackError {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

impl From<String> for CallbackError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// Handler invoked with each fresh snapshot of the subscriber's account.
pub type UpdateHandler = Arc<dyn Fn(&PortfolioSnapshot) -> Result<(), CallbackError> + Send + Sync>;

/// Handler invoked with fetch failures and terminal shutdown notices.
pub type ErrorHandler = Arc<dyn Fn(&UpdateError) -> Result<(), CallbackError> + Send + Sync>;

/// A registered observer: identity, update handler, optional error handler.
pub struct Subscriber {
    id: SubscriberId,
    on_update: UpdateHandler,
    on_error: Option<ErrorHandler>,
}

impl Subscriber {
    /// Create a subscriber with an update handler only.
    pub fn new<F>(id: SubscriberId, on_update: F) -> Self
    where
        F: Fn(&PortfolioSnapshot) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Self {
            id,
            on_update: Arc::new(on_update),
            on_error: None,
        }
    }

    /// Attach an error handler.
    #[must_use]
    pub fn with_error_handler<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&UpdateError) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// The subscriber's identity.
    #[must_use]
    pub const fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Whether an error handler is attached.
    #[must_use]
    pub const fn has_error_handler(&self) -> bool {
        self.on_error.is_some()
    }

    /// Invoke the update handler. A panicking handler is reported as an error.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or a description of its panic.
    pub fn notify_update(&self, snapshot: &PortfolioSnapshot) -> Result<(), CallbackError> {
        catch_unwind(AssertUnwindSafe(|| (self.on_update)(snapshot)))
            .unwrap_or_else(|panic| Err(panic_error(panic.as_ref())))
    }

    /// Invoke the error handler, if any. A panicking handler is reported as
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or a description of its panic.
    pub fn notify_error(&self, error: &UpdateError) -> Result<(), CallbackError> {
        let Some(on_error) = &self.on_error else {
            return Ok(());
        };
        catch_unwind(AssertUnwindSafe(|| on_error(error)))
            .unwrap_or_else(|panic| Err(panic_error(panic.as_ref())))
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("has_error_handler", &self.has_error_handler())
            .finish_non_exhaustive()
    }
}

fn panic_error(panic: &(dyn std::any::Any + Send)) -> CallbackError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    CallbackError::new(format!("handler panicked: {message}"))
}

// =============================================================================
// Registration
// =============================================================================

/// Receipt for one `subscribe` call; used to revoke exactly that entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    id: SubscriberId,
    token: Uuid,
}

impl Registration {
    /// Identity that was registered.
    #[must_use]
    pub const fn id(&self) -> &SubscriberId {
        &self.id
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug)]
struct Entry {
    token: Uuid,
    subscriber: Arc<Subscriber>,
}

/// Subscribers grouped by account, then by component.
#[derive(Debug, Default)]
struct RegistryState {
    accounts: BTreeMap<AccountId, BTreeMap<String, Entry>>,
    len: usize,
}

impl RegistryState {
    /// Insert or replace the entry for the subscriber's identity.
    fn insert(&mut self, subscriber: Subscriber) -> Registration {
        let id = subscriber.id().clone();
        let token = Uuid::new_v4();

        let components = self.accounts.entry(id.account_id.clone()).or_default();
        let previous = components.insert(
            id.component_id.clone(),
            Entry {
                token,
                subscriber: Arc::new(subscriber),
            },
        );

        // Replacing an identity does not change the count
        if previous.is_none() {
            self.len += 1;
        }

        Registration { id, token }
    }

    /// Remove an identity, optionally only if its token still matches.
    fn remove(&mut self, id: &SubscriberId, token: Option<Uuid>) -> bool {
        let Some(components) = self.accounts.get_mut(&id.account_id) else {
            return false;
        };

        let matches = components
            .get(&id.component_id)
            .is_some_and(|entry| token.is_none_or(|t| t == entry.token));
        if !matches {
            return false;
        }

        components.remove(&id.component_id);
        self.len -= 1;

        // Clean up empty account entry
        if components.is_empty() {
            self.accounts.remove(&id.account_id);
        }

        true
    }
}

// =============================================================================
// Subscriber Registry
// =============================================================================

/// Thread-safe registry of subscribers, indexed by account.
///
/// # Example
///
/// ```rust
/// use portfolio_updater::domain::subscription::{Subscriber, SubscriberId, SubscriberRegistry};
///
/// let registry = SubscriberRegistry::new();
///
/// let chart = registry.subscribe(Subscriber::new(SubscriberId::new("A", "chart"), |_| Ok(())));
/// registry.subscribe(Subscriber::new(SubscriberId::new("A", "table"), |_| Ok(())));
/// registry.subscribe(Subscriber::new(SubscriberId::new("B", "chart"), |_| Ok(())));
///
/// assert_eq!(registry.len(), 3);
/// assert_eq!(registry.accounts_of_interest().len(), 2);
///
/// // Revoking twice removes one entry
/// assert!(registry.revoke(&chart));
/// assert!(!registry.revoke(&chart));
/// assert_eq!(registry.len(), 2);
/// ```
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. An existing entry with the same identity is
    /// replaced.
    pub fn subscribe(&self, subscriber: Subscriber) -> Registration {
        self.state.write().insert(subscriber)
    }

    /// Remove the entry created by `registration`.
    ///
    /// Returns `false` if it was already removed or has since been replaced.
    pub fn revoke(&self, registration: &Registration) -> bool {
        self.state
            .write()
            .remove(&registration.id, Some(registration.token))
    }

    /// Remove whatever entry currently holds `id`. No-op if absent.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        self.state.write().remove(id, None)
    }

    /// Distinct accounts with at least one subscriber, in account order.
    #[must_use]
    pub fn accounts_of_interest(&self) -> Vec<AccountId> {
        self.state.read().accounts.keys().cloned().collect()
    }

    /// All subscribers observing `account`, in component order.
    #[must_use]
    pub fn subscribers_for_account(&self, account: &AccountId) -> Vec<Arc<Subscriber>> {
        self.state
            .read()
            .accounts
            .get(account)
            .map(|components| {
                components
                    .values()
                    .map(|entry| Arc::clone(&entry.subscriber))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every current subscriber.
    #[must_use]
    pub fn subscribers(&self) -> Vec<Arc<Subscriber>> {
        self.state
            .read()
            .accounts
            .values()
            .flat_map(BTreeMap::values)
            .map(|entry| Arc::clone(&entry.subscriber))
            .collect()
    }

    /// Whether `id` is currently registered.
    #[must_use]
    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.state
            .read()
            .accounts
            .get(&id.account_id)
            .is_some_and(|components| components.contains_key(&id.component_id))
    }

    /// Number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len
    }

    /// Whether no subscribers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct accounts of interest.
    #[must_use]
    pub fn account_count(&self) -> usize {
        self.state.read().accounts.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;

    fn noop(account: &str, component: &str) -> Subscriber {
        Subscriber::new(SubscriberId::new(account, component), |_| Ok(()))
    }

    fn snapshot(account: &str) -> PortfolioSnapshot {
        PortfolioSnapshot::new(AccountId::from(account), Decimal::ONE_HUNDRED, Utc::now())
    }

    #[test]
    fn parse_legacy_identity() {
        let id: SubscriberId = "ZX1234_holdings".parse().unwrap();
        assert_eq!(id.account_id(), &AccountId::from("ZX1234"));
        assert_eq!(id.component_id(), "holdings");
        assert_eq!(id.to_string(), "ZX1234_holdings");
    }

    #[test]
    fn parse_splits_at_first_separator() {
        let id = SubscriberId::parse("A_pnl_chart").unwrap();
        assert_eq!(id.account_id().as_str(), "A");
        assert_eq!(id.component_id(), "pnl_chart");
    }

    #[test]
    fn parse_rejects_malformed_identities() {
        assert_eq!(
            SubscriberId::parse("nounderscore"),
            Err(IdentityError::MissingSeparator("nounderscore".to_string()))
        );
        assert_eq!(
            SubscriberId::parse("_widget"),
            Err(IdentityError::EmptyAccount("_widget".to_string()))
        );
    }

    #[test]
    fn subscribe_groups_by_account() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(noop("A", "1"));
        registry.subscribe(noop("A", "2"));
        registry.subscribe(noop("B", "1"));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.account_count(), 2);
        assert_eq!(
            registry.accounts_of_interest(),
            vec![AccountId::from("A"), AccountId::from("B")]
        );

        let a: Vec<_> = registry
            .subscribers_for_account(&AccountId::from("A"))
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(a, vec!["A_1", "A_2"]);
        assert_eq!(registry.subscribers_for_account(&AccountId::from("B")).len(), 1);
        assert!(registry.subscribers_for_account(&AccountId::from("C")).is_empty());
    }

    #[test]
    fn duplicate_identity_overwrites() {
        let registry = SubscriberRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.subscribe(noop("A", "1"));
        let counter = Arc::clone(&hits);
        registry.subscribe(Subscriber::new(SubscriberId::new("A", "1"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert_eq!(registry.len(), 1);
        for subscriber in registry.subscribers_for_account(&AccountId::from("A")) {
            subscriber.notify_update(&snapshot("A")).unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn revoke_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let first = registry.subscribe(noop("A", "1"));
        registry.subscribe(noop("A", "2"));

        assert!(registry.revoke(&first));
        assert!(!registry.revoke(&first));
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(first.id()));
    }

    #[test]
    fn stale_revoke_keeps_replacement() {
        let registry = SubscriberRegistry::new();
        let stale = registry.subscribe(noop("A", "1"));
        let fresh = registry.subscribe(noop("A", "1"));

        assert!(!registry.revoke(&stale));
        assert!(registry.contains(fresh.id()));
        assert!(registry.revoke(&fresh));
        assert!(registry.is_empty());
    }

    #[test]
    fn unsubscribe_absent_is_noop() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(noop("A", "1"));

        assert!(!registry.unsubscribe(&SubscriberId::new("A", "2")));
        assert!(!registry.unsubscribe(&SubscriberId::new("B", "1")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn last_unsubscribe_drops_account() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(noop("A", "1"));
        registry.subscribe(noop("B", "1"));

        assert!(registry.unsubscribe(&SubscriberId::new("A", "1")));
        assert_eq!(registry.accounts_of_interest(), vec![AccountId::from("B")]);
        assert_eq!(registry.account_count(), 1);
    }

    #[test]
    fn subscribers_lists_everyone() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(noop("A", "1"));
        registry.subscribe(noop("B", "1"));
        registry.subscribe(noop("B", "2"));

        assert_eq!(registry.subscribers().len(), 3);
    }

    #[test]
    fn notify_update_catches_panics() {
        let subscriber = Subscriber::new(SubscriberId::new("A", "1"), |_| panic!("boom"));

        let err = subscriber.notify_update(&snapshot("A")).unwrap_err();
        assert_eq!(err.reason(), "handler panicked: boom");
    }

    #[test]
    fn notify_error_without_handler_is_ok() {
        let subscriber = noop("A", "1");
        let error = UpdateError::BudgetExhausted { failures: 3 };

        assert!(!subscriber.has_error_handler());
        assert!(subscriber.notify_error(&error).is_ok());
    }

    #[test]
    fn notify_error_reports_handler_failure() {
        let subscriber = noop("A", "1").with_error_handler(|_| Err("nope".into()));
        let error = UpdateError::BudgetExhausted { failures: 3 };

        assert_eq!(
            subscriber.notify_error(&error),
            Err(CallbackError::new("nope"))
        );
    }

    #[test]
    fn update_error_terminality() {
        assert!(UpdateError::BudgetExhausted { failures: 1 }.is_terminal());
        assert!(
            !UpdateError::Fetch {
                account: AccountId::from("A"),
                source: FetchError::Unavailable("down".to_string()),
            }
            .is_terminal()
        );
    }

    #[test]
    fn thread_safety_concurrent_subscriptions() {
        use std::thread;

        let registry = Arc::new(SubscriberRegistry::new());
        let mut handles = vec![];

        for i in 0..10 {
            let r = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                r.subscribe(noop("SHARED", &format!("w{i}")));
                r.subscribe(noop(&format!("ACC{i}"), "w"));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 20);
        // 10 unique accounts + 1 shared = 11
        assert_eq!(registry.account_count(), 11);
    }
}
