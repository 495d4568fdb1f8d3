//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reading source module exports and shared types."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Synthetic reading generation for the gridtel ingestion pipeline.

use chrono::{DateTime, Utc};
use gridtel_common::NewReading;

pub mod generator;
pub mod replay;

pub use generator::{GeneratorProfile, ReadingGenerator};
pub use replay::{ScenarioSample, ScenarioSource};

/// Anything able to produce the next candidate reading for ingestion.
pub trait ReadingSource: Send + 'static {
    /// Produce a reading stamped with `now`.
    fn next_reading(&mut self, now: DateTime<Utc>) -> NewReading;
}
