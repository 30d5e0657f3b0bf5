//! Core shared library for the Beacon telemetry activation service.
//!
//! This crate exposes the primitives every Beacon component depends on:
//! the canonical error type, configuration loading, the Postgres pool
//! wrapper and logging setup.

pub mod config;
pub mod db;
pub mod errors;
pub mod logging;

pub use config::{ActivationSettings, CoreConfig, Environment};
pub use errors::{BeaconError, ConfigError, Result as CoreResult};
