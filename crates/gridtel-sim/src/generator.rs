//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Synthetic reading generator with occasional anomalies."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use gridtel_common::config::{GeneratorConfig, ValueBand};
use gridtel_common::NewReading;
use rand::prelude::*;

use crate::ReadingSource;

/// Value bands and anomaly rate used by [`ReadingGenerator`].
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorProfile {
    pub anomaly_probability: f64,
    pub normal_voltage: ValueBand,
    pub normal_current: ValueBand,
    pub anomalous_low_voltage: ValueBand,
    pub anomalous_high_voltage: ValueBand,
    pub anomalous_current: ValueBand,
    pub frequency: ValueBand,
}

impl Default for GeneratorProfile {
    fn default() -> Self {
        Self::from(&GeneratorConfig::default())
    }
}

impl From<&GeneratorConfig> for GeneratorProfile {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            anomaly_probability: config.anomaly_probability,
            normal_voltage: config.normal_voltage,
            normal_current: config.normal_current,
            anomalous_low_voltage: config.anomalous_low_voltage,
            anomalous_high_voltage: config.anomalous_high_voltage,
            anomalous_current: config.anomalous_current,
            frequency: config.frequency,
        }
    }
}

/// Produces synthetic readings. Roughly one in ten (per profile) lands outside
/// the normal band to exercise downstream anomaly detection.
#[derive(Debug)]
pub struct ReadingGenerator {
    profile: GeneratorProfile,
    rng: StdRng,
}

impl ReadingGenerator {
    pub fn new(profile: GeneratorProfile, seed: u64) -> Self {
        Self {
            profile,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy(profile: GeneratorProfile) -> Self {
        Self {
            profile,
            rng: StdRng::from_entropy(),
        }
    }

    /// Build from configuration, seeding deterministically when a seed is set.
    pub fn from_config(config: &GeneratorConfig) -> Self {
        let profile = GeneratorProfile::from(config);
        match config.seed {
            Some(seed) => Self::new(profile, seed),
            None => Self::from_entropy(profile),
        }
    }

    pub fn profile(&self) -> &GeneratorProfile {
        &self.profile
    }

    pub fn generate(&mut self, now: DateTime<Utc>) -> NewReading {
        let (voltage, current) = if self.rng.gen_bool(self.profile.anomaly_probability) {
            let band = if self.rng.gen_bool(0.5) {
                self.profile.anomalous_low_voltage
            } else {
                self.profile.anomalous_high_voltage
            };
            (self.sample(band), self.sample(self.profile.anomalous_current))
        } else {
            (
                self.sample(self.profile.normal_voltage),
                self.sample(self.profile.normal_current),
            )
        };
        let frequency = self.sample(self.profile.frequency);

        NewReading {
            timestamp: now,
            voltage,
            current,
            frequency: Some(frequency),
        }
    }

    fn sample(&mut self, band: ValueBand) -> f64 {
        round2(self.rng.gen_range(band.min..=band.max))
    }
}

impl ReadingSource for ReadingGenerator {
    fn next_reading(&mut self, now: DateTime<Utc>) -> NewReading {
        self.generate(now)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
