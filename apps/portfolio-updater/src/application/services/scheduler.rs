//! Portfolio Update Scheduler
//!
//! Periodically refreshes portfolio snapshots for every account with at least
//! one subscriber and fans the results out.
//!
//! # Lifecycle
//!
//! ```text
//!            start()                 timer fires
//! Stopped ───────────► Armed ─────────────────────► Cycling
//!    ▲                   ▲                              │
//!    │                   └──── cycle done, budget ok ───┤
//!    │                                                  │
//!    └── stop() / registry empty / budget exhausted ────┘
//! ```
//!
//! Each `start()` spawns one task that loops: compute the delay from market
//! hours, sleep (or observe cancellation), run one cycle. `stop()` cancels the
//! sleep but not a fetch already in flight; that fetch's result is discarded
//! because every state change is tagged with the run's generation.
//!
//! # Fetch modes
//!
//! [`FetchMode::Sequential`] awaits each account before starting the next, so
//! callbacks for different accounts fire in account order.
//! [`FetchMode::Concurrent`] starts every fetch at once and fans out as each
//! resolves; callback order across accounts is then non-deterministic. In
//! both modes the budget is checked only after every account has resolved,
//! and a stop mid-cycle lets the remaining fetches finish before discarding
//! their results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ClockPort, PortfolioSourcePort, SystemClock};
use crate::domain::error_budget::ErrorBudget;
use crate::domain::market_hours::{MarketHours, MarketHoursOracle};
use crate::domain::portfolio::{AccountId, FetchError, PortfolioSnapshot};
use crate::domain::subscription::{
    Registration, Subscriber, SubscriberId, SubscriberRegistry, UpdateError,
};
use crate::infrastructure::metrics::{self, CallbackKind};

// =============================================================================
// Configuration
// =============================================================================

/// How accounts are fetched within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// One account at a time, in account order.
    #[default]
    Sequential,
    /// All accounts at once; fan-out as each resolves.
    Concurrent,
}

impl FetchMode {
    /// Parse fetch mode from string. Unknown values fall back to sequential.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "concurrent" => Self::Concurrent,
            _ => Self::Sequential,
        }
    }

    /// Mode name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Concurrent => "concurrent",
        }
    }
}

/// Immutable scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Delay between cycles while the market is open.
    pub market_hours_interval: Duration,
    /// Delay between cycles while the market is closed.
    pub after_hours_interval: Duration,
    /// Consecutive failed fetches that stop the scheduler.
    pub max_consecutive_failures: u32,
    /// Reserved retry hint; failed fetches are retried on the next tick.
    pub retry_delay: Duration,
    /// How accounts are fetched within a cycle.
    pub fetch_mode: FetchMode,
    /// Randomization of each delay as a fraction (e.g. 0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            market_hours_interval: Duration::from_secs(30),
            after_hours_interval: Duration::from_secs(300),
            max_consecutive_failures: 5,
            retry_delay: Duration::from_secs(10),
            fetch_mode: FetchMode::Sequential,
            jitter_factor: 0.0,
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration for values the scheduler cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerConfigError`] for zero intervals, a zero failure
    /// budget, or a jitter factor outside `[0, 1)`.
    pub fn validate(&self) -> Result<(), SchedulerConfigError> {
        if self.market_hours_interval.is_zero() {
            return Err(SchedulerConfigError::ZeroInterval("market_hours_interval"));
        }
        if self.after_hours_interval.is_zero() {
            return Err(SchedulerConfigError::ZeroInterval("after_hours_interval"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(SchedulerConfigError::ZeroFailureBudget);
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(SchedulerConfigError::InvalidJitter(self.jitter_factor));
        }
        Ok(())
    }

    /// Base delay for the given market state.
    #[must_use]
    pub const fn interval_for(&self, hours: &MarketHours) -> Duration {
        if hours.is_open() {
            self.market_hours_interval
        } else {
            self.after_hours_interval
        }
    }
}

/// Invalid scheduler configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerConfigError {
    /// A refresh interval is zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    /// The failure budget is zero.
    #[error("max_consecutive_failures must be greater than zero")]
    ZeroFailureBudget,
    /// Jitter factor outside `[0, 1)`.
    #[error("jitter factor {0} must be within [0, 1)")]
    InvalidJitter(f64),
}

// =============================================================================
// State and Statistics
// =============================================================================

/// Observable scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerPhase {
    /// Not running.
    #[default]
    Stopped,
    /// Waiting for the next tick.
    Armed,
    /// Fetching and fanning out.
    Cycling,
}

impl SchedulerPhase {
    /// Phase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Armed => "armed",
            Self::Cycling => "cycling",
        }
    }
}

/// Introspection snapshot for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// Whether the scheduler is between `start()` and any stop.
    pub running: bool,
    /// Current phase.
    pub phase: SchedulerPhase,
    /// Registered subscribers.
    pub subscriber_count: usize,
    /// Distinct accounts of interest.
    pub account_count: usize,
    /// Time of the most recent successful fetch.
    pub last_update: Option<DateTime<Utc>>,
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
    /// Cycles completed since construction.
    pub cycles_completed: u64,
    /// Active configuration.
    pub config: SchedulerConfig,
}

#[derive(Debug)]
struct SchedulerState {
    running: bool,
    phase: SchedulerPhase,
    /// Incremented by every `start()`; loops only act while theirs is current.
    generation: u64,
    cancel: Option<CancellationToken>,
    last_update: Option<DateTime<Utc>>,
    budget: ErrorBudget,
    cycles_completed: u64,
}

impl SchedulerState {
    const fn new(max_consecutive_failures: u32) -> Self {
        Self {
            running: false,
            phase: SchedulerPhase::Stopped,
            generation: 0,
            cancel: None,
            last_update: None,
            budget: ErrorBudget::new(max_consecutive_failures),
            cycles_completed: 0,
        }
    }

    const fn is_current(&self, generation: u64) -> bool {
        self.running && self.generation == generation
    }

    /// Transition to stopped. Returns `false` if already stopped.
    fn halt(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.phase = SchedulerPhase::Stopped;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Continue,
    Stop,
}

// =============================================================================
// Shared Core
// =============================================================================

struct Inner {
    config: SchedulerConfig,
    registry: Arc<SubscriberRegistry>,
    source: Arc<dyn PortfolioSourcePort>,
    oracle: MarketHoursOracle,
    clock: Arc<dyn ClockPort>,
    state: Mutex<SchedulerState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(cancel) = self.state.get_mut().cancel.take() {
            cancel.cancel();
        }
    }
}

impl Inner {
    /// Run `f` against the state only if `generation` is still the live run.
    fn with_current<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut SchedulerState) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        state.is_current(generation).then(|| f(&mut state))
    }

    fn stop(&self, reason: &'static str) {
        if self.state.lock().halt() {
            metrics::set_running(false);
            tracing::info!(reason, "Portfolio update scheduler stopped");
        }
    }

    fn stop_if_idle(&self) {
        metrics::set_subscribers(self.registry.len());
        if self.registry.is_empty() {
            self.stop("no subscribers remain");
        }
    }

    /// Mark the run armed and compute the delay until its next cycle.
    fn arm(&self, generation: u64) -> Option<Duration> {
        let hours = self.oracle.evaluate(self.clock.now());
        let delay = apply_jitter(
            self.config.interval_for(&hours),
            self.config.jitter_factor,
        );

        self.with_current(generation, |state| state.phase = SchedulerPhase::Armed)?;

        tracing::debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            market_open = hours.is_open(),
            "Next portfolio update armed"
        );
        Some(delay)
    }

    async fn run_cycle(&self, generation: u64) -> CycleOutcome {
        let accounts = self.registry.accounts_of_interest();

        let began = self.with_current(generation, |state| {
            if accounts.is_empty() {
                state.halt();
                false
            } else {
                state.phase = SchedulerPhase::Cycling;
                true
            }
        });
        match began {
            None => return CycleOutcome::Stop,
            Some(false) => {
                metrics::set_running(false);
                tracing::info!("No subscribers at tick, scheduler stopped");
                return CycleOutcome::Stop;
            }
            Some(true) => {}
        }

        tracing::debug!(generation, accounts = accounts.len(), "Update cycle started");

        match self.config.fetch_mode {
            FetchMode::Sequential => {
                for account in &accounts {
                    let result = self.fetch(account).await;
                    if !self.apply_result(generation, account, result) {
                        return CycleOutcome::Stop;
                    }
                }
            }
            FetchMode::Concurrent => {
                let mut pending: FuturesUnordered<_> = accounts
                    .iter()
                    .map(|account| async move { (account, self.fetch(account).await) })
                    .collect();
                let mut live = true;
                while let Some((account, result)) = pending.next().await {
                    if !live {
                        tracing::debug!(account = %account, "Discarding result from stopped run");
                        continue;
                    }
                    live = self.apply_result(generation, account, result);
                }
                if !live {
                    return CycleOutcome::Stop;
                }
            }
        }

        self.finish_cycle(generation)
    }

    async fn fetch(&self, account: &AccountId) -> Result<PortfolioSnapshot, FetchError> {
        let started = Instant::now();
        let result = self.source.fetch_snapshot(account).await;
        metrics::record_fetch(result.is_ok(), started.elapsed());
        result
    }

    /// Record one account's outcome and fan it out.
    ///
    /// Returns `false` (and discards the result) if the run was stopped while
    /// the fetch was in flight.
    fn apply_result(
        &self,
        generation: u64,
        account: &AccountId,
        result: Result<PortfolioSnapshot, FetchError>,
    ) -> bool {
        match result {
            Ok(snapshot) => {
                let now = self.clock.now();
                let recorded = self.with_current(generation, |state| {
                    state.last_update = Some(now);
                    state.budget.record_success();
                });
                if recorded.is_none() {
                    tracing::debug!(account = %account, "Discarding snapshot from stopped run");
                    return false;
                }
                metrics::set_consecutive_failures(0);
                let delivered = self.fan_out_update(account, &snapshot);
                tracing::debug!(account = %account, delivered, "Portfolio snapshot delivered");
            }
            Err(source) => {
                let Some(failures) =
                    self.with_current(generation, |state| state.budget.record_failure())
                else {
                    tracing::debug!(account = %account, "Discarding failure from stopped run");
                    return false;
                };
                metrics::set_consecutive_failures(failures);
                tracing::warn!(
                    account = %account,
                    error = %source,
                    failures,
                    max = self.config.max_consecutive_failures,
                    "Portfolio fetch failed"
                );
                let error = UpdateError::Fetch {
                    account: account.clone(),
                    source,
                };
                self.fan_out_error(account, &error);
            }
        }
        true
    }

    fn finish_cycle(&self, generation: u64) -> CycleOutcome {
        let verdict = self.with_current(generation, |state| {
            state.cycles_completed += 1;
            if state.budget.exceeded() {
                let failures = state.budget.consecutive_failures();
                state.halt();
                Some(failures)
            } else {
                None
            }
        });
        metrics::record_cycle();

        match verdict {
            None => CycleOutcome::Stop,
            Some(None) => CycleOutcome::Continue,
            Some(Some(failures)) => {
                self.announce_exhaustion(failures);
                CycleOutcome::Stop
            }
        }
    }

    /// Tell every subscriber, once, that the budget stopped the scheduler.
    ///
    /// Callers must already have halted the state under the same lock that
    /// observed the exhausted budget.
    fn announce_exhaustion(&self, failures: u32) {
        metrics::set_running(false);
        metrics::record_budget_exhausted();
        tracing::error!(
            failures,
            "Error budget exhausted, portfolio update scheduler stopped"
        );
        let error = UpdateError::BudgetExhausted { failures };
        for subscriber in self.registry.subscribers() {
            notify_error(&subscriber, &error);
        }
    }

    fn fan_out_update(&self, account: &AccountId, snapshot: &PortfolioSnapshot) -> usize {
        let subscribers = self.registry.subscribers_for_account(account);
        for subscriber in &subscribers {
            if let Err(error) = subscriber.notify_update(snapshot) {
                metrics::record_callback_failure(CallbackKind::Update);
                tracing::warn!(
                    subscriber = %subscriber.id(),
                    error = %error,
                    "Update handler failed"
                );
                let report = UpdateError::Callback {
                    subscriber: subscriber.id().clone(),
                    reason: error.to_string(),
                };
                notify_error(subscriber, &report);
            }
        }
        subscribers.len()
    }

    fn fan_out_error(&self, account: &AccountId, error: &UpdateError) {
        for subscriber in self.registry.subscribers_for_account(account) {
            notify_error(&subscriber, error);
        }
    }
}

fn notify_error(subscriber: &Subscriber, error: &UpdateError) {
    if let Err(failure) = subscriber.notify_error(error) {
        metrics::record_callback_failure(CallbackKind::Error);
        tracing::warn!(subscriber = %subscriber.id(), error = %failure, "Error handler failed");
    }
}

/// Apply ±`factor` random jitter, never going below one millisecond.
fn apply_jitter(duration: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return duration;
    }

    #[allow(clippy::cast_precision_loss)]
    let base_millis = duration.as_millis() as f64;
    let range = base_millis * factor;
    let jitter: f64 = rand::rng().random_range(-range..=range);
    let adjusted = (base_millis + jitter).max(1.0);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Duration::from_millis(adjusted as u64)
}

async fn run_loop(inner: Weak<Inner>, cancel: CancellationToken, generation: u64) {
    loop {
        let Some(delay) = inner.upgrade().and_then(|core| core.arm(generation)) else {
            break;
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        let Some(core) = inner.upgrade() else {
            break;
        };
        if core.run_cycle(generation).await == CycleOutcome::Stop {
            break;
        }
    }
    tracing::debug!(generation, "Update loop exited");
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Revocation handle returned by [`UpdateScheduler::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::revoke`].
pub struct Subscription {
    scheduler: Weak<Inner>,
    registry: Weak<SubscriberRegistry>,
    registration: Registration,
    revoked: AtomicBool,
}

impl Subscription {
    /// Identity this handle revokes.
    #[must_use]
    pub const fn id(&self) -> &SubscriberId {
        self.registration.id()
    }

    /// Remove the subscriber. Later calls have no effect.
    ///
    /// Stops the scheduler if this leaves the registry empty. The registry
    /// entry is removed even if the scheduler itself is already gone.
    pub fn revoke(&self) {
        if self.revoked.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if registry.revoke(&self.registration) {
            tracing::debug!(subscriber = %self.id(), "Subscription revoked");
            if let Some(core) = self.scheduler.upgrade() {
                core.stop_if_idle();
            }
        }
    }

    /// Whether [`Subscription::revoke`] has been called.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", self.id())
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Update Scheduler
// =============================================================================

/// Builder for [`UpdateScheduler`].
pub struct SchedulerBuilder {
    source: Arc<dyn PortfolioSourcePort>,
    config: SchedulerConfig,
    registry: Option<Arc<SubscriberRegistry>>,
    oracle: MarketHoursOracle,
    clock: Arc<dyn ClockPort>,
}

impl SchedulerBuilder {
    /// Use a configuration other than the default.
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing registry instead of creating one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<SubscriberRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a market hours oracle other than US equities.
    #[must_use]
    pub fn oracle(mut self, oracle: MarketHoursOracle) -> Self {
        self.oracle = oracle;
        self
    }

    /// Use a clock other than the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockPort>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and build the scheduler (stopped).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerConfigError`] if the configuration is invalid.
    pub fn build(self) -> Result<UpdateScheduler, SchedulerConfigError> {
        self.config.validate()?;
        let max_failures = self.config.max_consecutive_failures;
        Ok(UpdateScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                registry: self.registry.unwrap_or_default(),
                source: self.source,
                oracle: self.oracle,
                clock: self.clock,
                state: Mutex::new(SchedulerState::new(max_failures)),
            }),
        })
    }
}

/// Market-hours aware portfolio update scheduler.
///
/// Cheap to clone; clones share one scheduler. `start()` must be called from
/// within a Tokio runtime.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use portfolio_updater::application::ports::PortfolioSourcePort;
/// use portfolio_updater::application::services::scheduler::{SchedulerConfig, UpdateScheduler};
/// use portfolio_updater::domain::subscription::{Subscriber, SubscriberId};
///
/// async fn example(source: Arc<dyn PortfolioSourcePort>) {
///     let scheduler = UpdateScheduler::builder(source)
///         .config(SchedulerConfig::default())
///         .build()
///         .unwrap();
///
///     let subscription = scheduler.subscribe(
///         Subscriber::new(SubscriberId::new("ZX1234", "holdings"), |snapshot| {
///             println!("total value: {}", snapshot.total_value());
///             Ok(())
///         })
///         .with_error_handler(|error| {
///             eprintln!("update failed: {error}");
///             Ok(())
///         }),
///     );
///
///     scheduler.start();
///     // ...
///     subscription.revoke(); // last subscriber gone: scheduler stops itself
/// }
/// ```
#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<Inner>,
}

impl UpdateScheduler {
    /// Start building a scheduler around a portfolio source.
    #[must_use]
    pub fn builder(source: Arc<dyn PortfolioSourcePort>) -> SchedulerBuilder {
        SchedulerBuilder {
            source,
            config: SchedulerConfig::default(),
            registry: None,
            oracle: MarketHoursOracle::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Build a scheduler with the default oracle and system clock.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerConfigError`] if the configuration is invalid.
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn PortfolioSourcePort>,
        registry: Arc<SubscriberRegistry>,
    ) -> Result<Self, SchedulerConfigError> {
        Self::builder(source)
            .config(config)
            .registry(registry)
            .build()
    }

    /// Start periodic updates. No-op if already running.
    ///
    /// Clears the error budget so a scheduler stopped by repeated failures
    /// gets a fresh budget.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.running {
            tracing::debug!("Scheduler already running");
            return;
        }

        state.running = true;
        state.phase = SchedulerPhase::Armed;
        state.generation += 1;
        state.budget.reset();
        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        let generation = state.generation;
        drop(state);

        metrics::set_running(true);
        metrics::set_consecutive_failures(0);
        tracing::info!(
            generation,
            subscribers = self.inner.registry.len(),
            fetch_mode = self.inner.config.fetch_mode.as_str(),
            "Portfolio update scheduler started"
        );

        tokio::spawn(run_loop(Arc::downgrade(&self.inner), cancel, generation));
    }

    /// Stop periodic updates. No-op if already stopped.
    ///
    /// A fetch already in flight completes but its result is discarded.
    pub fn stop(&self) {
        self.inner.stop("stop requested");
    }

    /// Register a subscriber and return its revocation handle.
    pub fn subscribe(&self, subscriber: Subscriber) -> Subscription {
        let registration = self.inner.registry.subscribe(subscriber);
        metrics::set_subscribers(self.inner.registry.len());
        tracing::debug!(subscriber = %registration.id(), "Subscriber registered");

        Subscription {
            scheduler: Arc::downgrade(&self.inner),
            registry: Arc::downgrade(&self.inner.registry),
            registration,
            revoked: AtomicBool::new(false),
        }
    }

    /// Remove a subscriber by identity. Stops the scheduler if none remain.
    ///
    /// Returns whether a subscriber was removed.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self.inner.registry.unsubscribe(id);
        if removed {
            tracing::debug!(subscriber = %id, "Subscriber removed");
            self.inner.stop_if_idle();
        }
        removed
    }

    /// Fetch one account now, outside the timer, and fan the result out.
    ///
    /// Works whether or not the scheduler is running. The outcome counts
    /// against the shared error budget like a timed fetch; if a failure
    /// exhausts it while running, the scheduler stops and every subscriber
    /// receives [`UpdateError::BudgetExhausted`].
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Fetch`] if the data source fails; the account's
    /// subscribers receive the same error.
    pub async fn force_update(
        &self,
        account: &AccountId,
    ) -> Result<PortfolioSnapshot, UpdateError> {
        tracing::info!(account = %account, "Forced portfolio update");

        match self.inner.fetch(account).await {
            Ok(snapshot) => {
                let now = self.inner.clock.now();
                {
                    let mut state = self.inner.state.lock();
                    state.last_update = Some(now);
                    state.budget.record_success();
                }
                metrics::set_consecutive_failures(0);
                self.inner.fan_out_update(account, &snapshot);
                Ok(snapshot)
            }
            Err(source) => {
                let (failures, exhausted) = {
                    let mut state = self.inner.state.lock();
                    let failures = state.budget.record_failure();
                    let exhausted = state.running && state.budget.exceeded() && state.halt();
                    (failures, exhausted)
                };
                metrics::set_consecutive_failures(failures);
                tracing::warn!(
                    account = %account,
                    error = %source,
                    failures,
                    "Forced portfolio update failed"
                );
                let error = UpdateError::Fetch {
                    account: account.clone(),
                    source,
                };
                self.inner.fan_out_error(account, &error);
                if exhausted {
                    self.inner.announce_exhaustion(failures);
                }
                Err(error)
            }
        }
    }

    /// Current market state.
    #[must_use]
    pub fn market_status(&self) -> MarketHours {
        self.inner.oracle.evaluate(self.inner.clock.now())
    }

    /// Introspection snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            running: state.running,
            phase: state.phase,
            subscriber_count: self.inner.registry.len(),
            account_count: self.inner.registry.account_count(),
            last_update: state.last_update,
            consecutive_failures: state.budget.consecutive_failures(),
            cycles_completed: state.cycles_completed,
            config: self.inner.config.clone(),
        }
    }

    /// Whether the scheduler is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// The subscriber registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.inner.registry
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("UpdateScheduler")
            .field("running", &state.running)
            .field("phase", &state.phase)
            .field("subscribers", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::TimeZone;
    use chrono_tz::America::New_York;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::{FixedClock, MockPortfolioSourcePort};

    fn snapshot(account: &AccountId) -> PortfolioSnapshot {
        PortfolioSnapshot::new(account.clone(), Decimal::ONE_HUNDRED, Utc::now())
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            market_hours_interval: Duration::from_millis(20),
            after_hours_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        }
    }

    fn scheduler_with(source: MockPortfolioSourcePort) -> UpdateScheduler {
        UpdateScheduler::builder(Arc::new(source))
            .config(fast_config())
            .build()
            .unwrap()
    }

    fn counting(id: &str, hits: &Arc<AtomicUsize>) -> Subscriber {
        let hits = Arc::clone(hits);
        Subscriber::new(id.parse().unwrap(), move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn default_config_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.market_hours_interval, Duration::from_secs(30));
        assert_eq!(config.after_hours_interval, Duration::from_secs(300));
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.retry_delay, Duration::from_secs(10));
        assert_eq!(config.fetch_mode, FetchMode::Sequential);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_validation() {
        let zero_market = SchedulerConfig {
            market_hours_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert_eq!(
            zero_market.validate(),
            Err(SchedulerConfigError::ZeroInterval("market_hours_interval"))
        );

        let zero_after = SchedulerConfig {
            after_hours_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert!(zero_after.validate().is_err());

        let zero_budget = SchedulerConfig {
            max_consecutive_failures: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(
            zero_budget.validate(),
            Err(SchedulerConfigError::ZeroFailureBudget)
        );

        let bad_jitter = SchedulerConfig {
            jitter_factor: 1.0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            bad_jitter.validate(),
            Err(SchedulerConfigError::InvalidJitter(_))
        ));
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let result = UpdateScheduler::builder(Arc::new(MockPortfolioSourcePort::new()))
            .config(SchedulerConfig {
                max_consecutive_failures: 0,
                ..SchedulerConfig::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn interval_follows_market_state() {
        let config = SchedulerConfig::default();
        let oracle = MarketHoursOracle::default();
        let open = oracle.evaluate(
            New_York
                .with_ymd_and_hms(2024, 1, 8, 10, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
        );
        let closed = oracle.evaluate(
            New_York
                .with_ymd_and_hms(2024, 1, 13, 10, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
        );

        assert_eq!(config.interval_for(&open), Duration::from_secs(30));
        assert_eq!(config.interval_for(&closed), Duration::from_secs(300));
    }

    #[test]
    fn fetch_mode_parsing() {
        assert_eq!(
            FetchMode::from_str_case_insensitive("CONCURRENT"),
            FetchMode::Concurrent
        );
        assert_eq!(
            FetchMode::from_str_case_insensitive("sequential"),
            FetchMode::Sequential
        );
        assert_eq!(
            FetchMode::from_str_case_insensitive("bogus"),
            FetchMode::Sequential
        );
        assert_eq!(FetchMode::Concurrent.as_str(), "concurrent");
    }

    #[test]
    fn jitter_bounds() {
        assert_eq!(
            apply_jitter(Duration::from_millis(1000), 0.0),
            Duration::from_millis(1000)
        );
        for _ in 0..100 {
            let millis = apply_jitter(Duration::from_millis(1000), 0.1).as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn market_status_uses_injected_clock() {
        let friday_evening = New_York
            .with_ymd_and_hms(2024, 1, 12, 17, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let scheduler = UpdateScheduler::builder(Arc::new(MockPortfolioSourcePort::new()))
            .clock(Arc::new(FixedClock::new(friday_evening)))
            .build()
            .unwrap();

        let status = scheduler.market_status();
        assert!(!status.is_open());
        assert_eq!(
            status.next_open(),
            Some(
                New_York
                    .with_ymd_and_hms(2024, 1, 15, 9, 30, 0)
                    .unwrap()
                    .with_timezone(&Utc)
            )
        );
    }

    #[tokio::test]
    async fn start_twice_spawns_one_run() {
        let mut source = MockPortfolioSourcePort::new();
        source
            .expect_fetch_snapshot()
            .returning(|account| Ok(snapshot(account)));
        let scheduler = scheduler_with(source);
        scheduler.subscribe(Subscriber::new(SubscriberId::new("A", "1"), |_| Ok(())));

        scheduler.start();
        scheduler.start();

        assert_eq!(scheduler.inner.state.lock().generation, 1);
        assert!(scheduler.is_running());
        assert_eq!(scheduler.stats().phase, SchedulerPhase::Armed);

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.stats().phase, SchedulerPhase::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let scheduler = scheduler_with(MockPortfolioSourcePort::new());
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn empty_registry_at_tick_stops_without_fetching() {
        let mut source = MockPortfolioSourcePort::new();
        source.expect_fetch_snapshot().times(0);
        let scheduler = scheduler_with(source);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = scheduler.stats();
        assert!(!stats.running);
        assert_eq!(stats.cycles_completed, 0);
    }

    #[tokio::test]
    async fn force_update_fans_out_and_returns_snapshot() {
        let mut source = MockPortfolioSourcePort::new();
        source
            .expect_fetch_snapshot()
            .times(1)
            .returning(|account| Ok(snapshot(account)));
        let scheduler = scheduler_with(source);
        let hits = Arc::new(AtomicUsize::new(0));
        scheduler.subscribe(counting("A_1", &hits));
        scheduler.subscribe(counting("A_2", &hits));
        scheduler.subscribe(counting("B_1", &hits));

        let result = scheduler.force_update(&AccountId::from("A")).await;

        assert_eq!(result.unwrap().account_id, AccountId::from("A"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(scheduler.stats().last_update.is_some());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn force_update_failure_reaches_caller_and_subscribers() {
        let mut source = MockPortfolioSourcePort::new();
        source
            .expect_fetch_snapshot()
            .returning(|_| Err(FetchError::Unavailable("backend down".to_string())));
        let scheduler = scheduler_with(source);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        scheduler.subscribe(
            Subscriber::new(SubscriberId::new("A", "1"), |_| Ok(())).with_error_handler(
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            ),
        );

        let result = scheduler.force_update(&AccountId::from("A")).await;

        assert!(matches!(result, Err(UpdateError::Fetch { .. })));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().consecutive_failures, 1);
        assert!(scheduler.stats().last_update.is_none());
    }

    #[tokio::test]
    async fn force_update_failures_exhaust_budget_while_running() {
        let mut source = MockPortfolioSourcePort::new();
        source
            .expect_fetch_snapshot()
            .returning(|_| Err(FetchError::Unavailable("backend down".to_string())));
        let scheduler = UpdateScheduler::builder(Arc::new(source))
            .config(SchedulerConfig {
                market_hours_interval: Duration::from_secs(60),
                after_hours_interval: Duration::from_secs(60),
                max_consecutive_failures: 2,
                ..SchedulerConfig::default()
            })
            .build()
            .unwrap();
        let terminal = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&terminal);
        scheduler.subscribe(
            Subscriber::new(SubscriberId::new("A", "1"), |_| Ok(())).with_error_handler(
                move |error| {
                    if error.is_terminal() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                },
            ),
        );
        scheduler.start();

        let account = AccountId::from("A");
        assert!(scheduler.force_update(&account).await.is_err());
        assert!(scheduler.is_running());
        assert!(scheduler.force_update(&account).await.is_err());
        assert!(!scheduler.is_running());
        assert_eq!(terminal.load(Ordering::SeqCst), 1);

        // Further failures while stopped count but do not re-announce
        assert!(scheduler.force_update(&account).await.is_err());
        assert_eq!(scheduler.stats().consecutive_failures, 3);
        assert_eq!(terminal.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_update_success_resets_budget() {
        let mut source = MockPortfolioSourcePort::new();
        let mut fail_next = vec![true, false].into_iter();
        source.expect_fetch_snapshot().returning(move |account| {
            if fail_next.next().unwrap_or(false) {
                Err(FetchError::Unavailable("backend down".to_string()))
            } else {
                Ok(snapshot(account))
            }
        });
        let scheduler = scheduler_with(source);
        let account = AccountId::from("A");

        assert!(scheduler.force_update(&account).await.is_err());
        assert_eq!(scheduler.stats().consecutive_failures, 1);
        assert!(scheduler.force_update(&account).await.is_ok());
        assert_eq!(scheduler.stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn revoke_reaches_shared_registry_after_scheduler_drop() {
        let registry = Arc::new(SubscriberRegistry::new());
        let scheduler = UpdateScheduler::builder(Arc::new(MockPortfolioSourcePort::new()))
            .registry(Arc::clone(&registry))
            .build()
            .unwrap();
        let subscription =
            scheduler.subscribe(Subscriber::new(SubscriberId::new("A", "1"), |_| Ok(())));
        drop(scheduler);
        assert_eq!(registry.len(), 1);

        subscription.revoke();

        assert!(subscription.is_revoked());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_identity_keeps_running() {
        let mut source = MockPortfolioSourcePort::new();
        source
            .expect_fetch_snapshot()
            .returning(|account| Ok(snapshot(account)));
        let scheduler = scheduler_with(source);
        scheduler.subscribe(Subscriber::new(SubscriberId::new("A", "1"), |_| Ok(())));
        scheduler.start();

        assert!(!scheduler.unsubscribe(&SubscriberId::new("A", "2")));
        assert!(scheduler.is_running());

        scheduler.stop();
    }

    #[tokio::test]
    async fn dropping_last_handle_ends_loop() {
        let mut source = MockPortfolioSourcePort::new();
        source
            .expect_fetch_snapshot()
            .returning(|account| Ok(snapshot(account)));
        let scheduler = scheduler_with(source);
        scheduler.subscribe(Subscriber::new(SubscriberId::new("A", "1"), |_| Ok(())));
        scheduler.start();

        let weak = Arc::downgrade(&scheduler.inner);
        drop(scheduler);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(weak.upgrade().is_none());
    }
}
