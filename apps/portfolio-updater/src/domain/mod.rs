//! Domain Layer - Core scheduling types and business logic.
//!
//! Pure Rust types with no I/O: portfolio payloads, market hours, the
//! subscriber registry, and the failure budget.

/// Portfolio snapshot payload and account identity.
pub mod portfolio;

/// Exchange session rules and the market hours oracle.
pub mod market_hours;

/// Subscriber identities, callbacks, and the registry.
pub mod subscription;

/// Consecutive-failure budget.
pub mod error_budget;
