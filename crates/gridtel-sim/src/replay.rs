//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Scripted reading source replaying a fixed scenario."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use gridtel_common::NewReading;
use serde::Deserialize;
use tracing::debug;

use crate::ReadingSource;

/// One scripted sample. Timestamps always come from the ingesting clock.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScenarioSample {
    pub voltage: f64,
    pub current: f64,
    #[serde(default)]
    pub frequency: Option<f64>,
}

impl ScenarioSample {
    pub fn new(voltage: f64, current: f64, frequency: Option<f64>) -> Self {
        Self {
            voltage,
            current,
            frequency,
        }
    }
}

/// Replays scripted samples in order, wrapping around at the end.
#[derive(Debug, Clone)]
pub struct ScenarioSource {
    samples: Vec<ScenarioSample>,
    cursor: usize,
}

impl ScenarioSource {
    pub fn new(samples: Vec<ScenarioSample>) -> Result<Self> {
        ensure!(!samples.is_empty(), "scenario must contain at least one sample");
        Ok(Self { samples, cursor: 0 })
    }

    /// Load a JSON array of samples.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read scenario file {}", path.display()))?;
        let samples: Vec<ScenarioSample> = serde_json::from_str(&contents)
            .with_context(|| format!("invalid scenario JSON {}", path.display()))?;
        debug!(path = %path.display(), samples = samples.len(), "scenario loaded");
        Self::new(samples).with_context(|| format!("empty scenario {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl ReadingSource for ScenarioSource {
    fn next_reading(&mut self, now: DateTime<Utc>) -> NewReading {
        let sample = self.samples[self.cursor];
        self.cursor = (self.cursor + 1) % self.samples.len();
        NewReading {
            timestamp: now,
            voltage: sample.voltage,
            current: sample.current,
            frequency: sample.frequency,
        }
    }
}
