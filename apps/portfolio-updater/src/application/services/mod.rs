//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `scheduler`: Market-hours aware polling loop with subscriber fan-out

pub mod scheduler;

pub use scheduler::{
    FetchMode, SchedulerBuilder, SchedulerConfig, SchedulerConfigError, SchedulerPhase,
    SchedulerStats, Subscription, UpdateScheduler,
};
