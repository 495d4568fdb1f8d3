//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the gridtel workspace.
//! This crate exposes the reading model, configuration loading, the clock
//! abstraction, and logging setup consumed across the workspace.

pub mod config;
pub mod logging;
pub mod reading;
pub mod time;

pub use config::{
    ApiConfig, AppConfig, BroadcastConfig, GeneratorConfig, IngestConfig, LoggingConfig,
    MetricsConfig, ReportConfig, StorageConfig, ValueBand,
};
pub use logging::{init_tracing, LogFormat};
pub use reading::{NewReading, Reading};
pub use time::{Clock, ManualClock, SystemClock};
