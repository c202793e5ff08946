//! Error Budget
//!
//! Counts consecutive fetch failures across update cycles. The count is shared
//! by every polled account: one success anywhere resets it, every failed
//! account fetch adds one. Once the count reaches the configured maximum the
//! scheduler shuts down.

/// Consecutive-failure counter gating automatic shutdown.
///
/// # Example
///
/// ```rust
/// use portfolio_updater::domain::error_budget::ErrorBudget;
///
/// let mut budget = ErrorBudget::new(2);
/// budget.record_failure();
/// assert!(!budget.exceeded());
///
/// budget.record_failure();
/// assert!(budget.exceeded());
///
/// budget.record_success();
/// assert_eq!(budget.consecutive_failures(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorBudget {
    max_consecutive_failures: u32,
    consecutive_failures: u32,
}

impl ErrorBudget {
    /// Create a budget allowing `max_consecutive_failures - 1` failures in a
    /// row before it is exceeded.
    #[must_use]
    pub const fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures,
            consecutive_failures: 0,
        }
    }

    /// Reset the counter after a successful fetch.
    pub const fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count one failed fetch. Returns the new count.
    pub const fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// Whether the failure count has reached the maximum.
    #[must_use]
    pub const fn exceeded(&self) -> bool {
        self.consecutive_failures >= self.max_consecutive_failures
    }

    /// Current consecutive failure count.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Configured maximum.
    #[must_use]
    pub const fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    /// Failures left before the budget is exceeded.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.max_consecutive_failures
            .saturating_sub(self.consecutive_failures)
    }

    /// Clear the counter, e.g. when the scheduler is restarted.
    pub const fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let budget = ErrorBudget::new(3);
        assert_eq!(budget.consecutive_failures(), 0);
        assert_eq!(budget.remaining(), 3);
        assert!(!budget.exceeded());
    }

    #[test]
    fn exceeded_at_maximum() {
        let mut budget = ErrorBudget::new(3);

        assert_eq!(budget.record_failure(), 1);
        assert_eq!(budget.record_failure(), 2);
        assert!(!budget.exceeded());

        assert_eq!(budget.record_failure(), 3);
        assert!(budget.exceeded());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn interleaved_success_resets() {
        let mut budget = ErrorBudget::new(3);

        budget.record_failure();
        budget.record_failure();
        budget.record_success();
        budget.record_failure();
        budget.record_failure();

        assert_eq!(budget.consecutive_failures(), 2);
        assert!(!budget.exceeded());
    }

    #[test]
    fn reset_clears_exhausted_budget() {
        let mut budget = ErrorBudget::new(1);
        budget.record_failure();
        assert!(budget.exceeded());

        budget.reset();
        assert!(!budget.exceeded());
        assert_eq!(budget.max_consecutive_failures(), 1);
    }

    #[test]
    fn failure_count_saturates() {
        let mut budget = ErrorBudget {
            max_consecutive_failures: 5,
            consecutive_failures: u32::MAX,
        };
        assert_eq!(budget.record_failure(), u32::MAX);
    }
}
