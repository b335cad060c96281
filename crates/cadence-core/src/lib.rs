//! `cadence-core`: configuration and shared error types for the cadence job scheduler.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, DatabaseConfig, EvaluatorKind, LoggingConfig, SchedulerConfig};
pub use error::{CadenceError, Result};
