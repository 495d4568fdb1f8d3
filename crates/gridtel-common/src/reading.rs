//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry reading model shared by storage, ingestion, and transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Voltage window considered nominal by downstream anomaly detection.
pub const NOMINAL_VOLTAGE_RANGE: (f64, f64) = (215.0, 245.0);

/// Current above which a reading is flagged by downstream anomaly detection.
pub const CURRENT_ALARM_THRESHOLD: f64 = 20.0;

/// A reading that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    /// Generation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Line voltage in volts.
    pub voltage: f64,
    /// Line current in amps.
    pub current: f64,
    /// Grid frequency in hertz, when measured.
    #[serde(default)]
    pub frequency: Option<f64>,
}

impl NewReading {
    /// True when every measured value is a finite number.
    pub fn is_finite(&self) -> bool {
        self.voltage.is_finite()
            && self.current.is_finite()
            && self.frequency.map_or(true, f64::is_finite)
    }

    /// Attach the identity assigned by the store.
    pub fn with_id(self, id: i64) -> Reading {
        Reading {
            id,
            timestamp: self.timestamp,
            voltage: self.voltage,
            current: self.current,
            frequency: self.frequency,
        }
    }
}

/// A persisted telemetry reading. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Store-assigned identity, strictly increasing in insertion order.
    pub id: i64,
    /// Generation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Line voltage in volts.
    pub voltage: f64,
    /// Line current in amps.
    pub current: f64,
    /// Grid frequency in hertz, when measured.
    #[serde(default)]
    pub frequency: Option<f64>,
}

impl Reading {
    /// True when the reading falls outside the nominal voltage window or exceeds
    /// the current alarm threshold.
    pub fn is_anomalous(&self) -> bool {
        let (low, high) = NOMINAL_VOLTAGE_RANGE;
        self.voltage < low || self.voltage > high || self.current > CURRENT_ALARM_THRESHOLD
    }
}
