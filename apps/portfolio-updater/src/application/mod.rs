//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the update scheduler and the port interfaces that
//! define how it reaches external systems.

/// Port interfaces for external systems (portfolio backend, clock).
pub mod ports;

/// Application services (the update scheduler).
pub mod services;
