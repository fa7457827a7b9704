//! `toolrun` Core Library
//!
//! Shared functionality for `toolrun` components:
//! - Configuration resolution and hierarchy
//! - Common error types
//! - Tracing/logging initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, ConcurrencyConfig, ExecutorConfig, JobConfig};
pub use error::{Error, Result};
