//! Configuration Module
//!
//! Configuration loading for the updater service.

mod settings;

pub use settings::{ConfigError, Exchange, ServerSettings, UpdaterConfig};
