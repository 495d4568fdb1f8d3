//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy shared by the request-facing services."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use gridtel_persistence::StorageError;

/// Malformed or out-of-policy caller input.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed {field} timestamp '{value}': expected ISO 8601 / RFC 3339")]
    MalformedTimestamp { field: &'static str, value: String },
    #[error("start ({start}) must not be after end ({end})")]
    InvertedRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("num_records must not be negative (got {0})")]
    NegativeCount(i64),
    #[error("batch of {requested} readings exceeds the maximum of {max}")]
    BatchTooLarge { requested: usize, max: usize },
    #[error("report requires at least one reading")]
    EmptyReportInput,
    #[error("readings could not be encoded: {0}")]
    Unencodable(String),
}

/// Failures of the external report collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("report service is not configured: {0}")]
    NotConfigured(String),
    #[error("report service unavailable: {0}")]
    Unavailable(String),
    #[error("report service returned an unexpected response: {0}")]
    InvalidResponse(String),
}

/// Top-level error surfaced at the request boundary.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}
