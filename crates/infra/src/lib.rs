//! Infrastructure layer: queue stores, dispatch workers, gateway client, config.

pub mod config;
pub mod delivery;
pub mod jobs;

pub use config::{ConfigError, CourierConfig};
