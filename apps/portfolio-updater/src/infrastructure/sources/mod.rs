//! Portfolio Source Adapters
//!
//! Implementations of
//! [`PortfolioSourcePort`](crate::application::ports::PortfolioSourcePort).
//!
//! - `SimulatedPortfolioSource`: In-memory portfolios whose prices drift on
//!   every fetch, for local runs and demos

mod simulated;

pub use simulated::{SimulatedPortfolioSource, SimulatedSourceConfig};
