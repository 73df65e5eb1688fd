//! `crema-store` – Persistence for the boiler control core.
//!
//! # Modules
//!
//! - [`config`] – [`ConfigStore`][config::ConfigStore]: the on-disk JSON
//!   configuration document. Whole-file atomic replacement, unknown-key
//!   preservation, permissive-then-fallback numeric validation with a
//!   last-known-good snapshot, and polled hot reload.
//! - [`telemetry`] – [`TelemetryStore`][telemetry::TelemetryStore]: the
//!   SQLite time-series of temperature/output samples, with
//!   write-amplification-aware batching and hourly retention pruning.

pub mod config;
pub mod telemetry;

pub use config::{BoilerConfig, ConfigError, ConfigStore};
pub use telemetry::{BATCH_SIZE, RETENTION_DAYS, TelemetryError, TelemetryStore};
