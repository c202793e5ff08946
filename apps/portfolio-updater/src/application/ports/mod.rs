//! Port Interfaces
//!
//! Contracts the scheduler depends on, following the Hexagonal Architecture
//! pattern. Infrastructure adapters implement them; tests substitute fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - `PortfolioSourcePort`: fetches one account's portfolio snapshot
//! - `ClockPort`: supplies the current instant for market-hours decisions

mod clock_port;
mod portfolio_source_port;

pub use clock_port::{ClockPort, FixedClock, SystemClock};
#[cfg(test)]
pub use portfolio_source_port::MockPortfolioSourcePort;
pub use portfolio_source_port::PortfolioSourcePort;
