//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reading store abstraction and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridtel_common::{NewReading, Reading};

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Number of readings returned when the caller gives no usable limit.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The database could not be opened or initialised.
    #[error("failed to open reading store: {0}")]
    Open(String),
    /// Wrapper for SQLite driver failures.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A reading violated a storage constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The storage worker is gone (shut down or crashed).
    #[error("storage worker unavailable")]
    WorkerUnavailable,
    /// Wrapper for IO errors while preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Range and size constraints for a reading query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadingQuery {
    /// Maximum number of readings returned.
    pub limit: usize,
    /// Inclusive lower timestamp bound.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper timestamp bound.
    pub end: Option<DateTime<Utc>>,
}

impl ReadingQuery {
    /// Unbounded query returning the newest `limit` readings.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            start: None,
            end: None,
        }
    }

    /// Restrict the query to `[start, end]`; either bound may be omitted.
    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }
}

impl Default for ReadingQuery {
    fn default() -> Self {
        Self::latest(DEFAULT_QUERY_LIMIT)
    }
}

/// Durable, ordered collection of readings.
///
/// Implementations must serialise transaction state internally so concurrent
/// callers never observe each other's uncommitted writes.
#[async_trait]
pub trait ReadingStore: Send + Sync + 'static {
    /// Persist one reading and return it with its assigned id.
    async fn insert(&self, reading: NewReading) -> Result<Reading>;

    /// Persist a batch inside a single transaction. Either every reading is
    /// committed (ids assigned in input order) or none is.
    async fn insert_batch(&self, readings: Vec<NewReading>) -> Result<Vec<Reading>>;

    /// Readings inside the query bounds, newest first, truncated to the limit.
    async fn query(&self, query: ReadingQuery) -> Result<Vec<Reading>>;

    /// Remove every reading and return how many were removed.
    async fn delete_all(&self) -> Result<u64>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<()>;
}

pub mod metrics;
pub mod sqlite;

pub use metrics::StoreMetrics;
pub use sqlite::SqliteReadingStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_query_uses_default_limit() {
        let query = ReadingQuery::default();
        assert_eq!(query.limit, DEFAULT_QUERY_LIMIT);
        assert!(query.start.is_none() && query.end.is_none());
    }

    #[test]
    fn error_messages_are_descriptive() {
        let err = StorageError::Constraint("voltage must be finite".into());
        assert_eq!(
            format!("{err}"),
            "constraint violation: voltage must be finite"
        );
        assert_eq!(
            format!("{}", StorageError::WorkerUnavailable),
            "storage worker unavailable"
        );
    }
}
