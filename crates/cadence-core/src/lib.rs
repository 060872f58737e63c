//! `cadence-core` — configuration and shared error types for the cadence workspace.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, SchedulerConfig};
pub use error::{CadenceError, Result};
