//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Read-side access to stored readings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use gridtel_common::Reading;
use gridtel_persistence::{ReadingQuery, ReadingStore, DEFAULT_QUERY_LIMIT};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{GridError, ValidationError};

/// Caller-supplied filter, typically deserialized from a query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilterParams {
    #[serde(default, alias = "start_timestamp")]
    pub start: Option<String>,
    #[serde(default, alias = "end_timestamp")]
    pub end: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Parse an ISO 8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::MalformedTimestamp {
        field,
        value: value.to_owned(),
    })
}

fn effective_limit(limit: Option<i64>) -> usize {
    match limit {
        Some(limit) if limit > 0 => usize::try_from(limit).unwrap_or(usize::MAX),
        _ => DEFAULT_QUERY_LIMIT,
    }
}

fn parse_bound(field: &'static str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match value {
        Some(raw) if !raw.trim().is_empty() => parse_timestamp(field, raw).map(Some),
        _ => Ok(None),
    }
}

/// Latest/filter/delete/health operations over the reading store.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn ReadingStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn ReadingStore>) -> Self {
        Self { store }
    }

    /// Newest readings first. A missing or non-positive limit means 100.
    pub async fn latest(&self, limit: Option<i64>) -> Result<Vec<Reading>, GridError> {
        let query = ReadingQuery::latest(effective_limit(limit));
        Ok(self.store.query(query).await?)
    }

    /// Readings whose timestamp lies in the inclusive `[start, end]` window.
    pub async fn filter(&self, params: &FilterParams) -> Result<Vec<Reading>, GridError> {
        let start = parse_bound("start", params.start.as_deref())?;
        let end = parse_bound("end", params.end.as_deref())?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(ValidationError::InvertedRange { start, end }.into());
            }
        }
        let query = ReadingQuery::latest(effective_limit(params.limit)).between(start, end);
        debug!(?start, ?end, limit = query.limit, "filtering readings");
        Ok(self.store.query(query).await?)
    }

    pub async fn delete_all(&self) -> Result<u64, GridError> {
        let removed = self.store.delete_all().await?;
        info!(removed, "all readings deleted");
        Ok(removed)
    }

    pub async fn health(&self) -> Result<(), GridError> {
        Ok(self.store.health_check().await?)
    }
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_with_offsets() {
        let parsed = parse_timestamp("start", "2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
        let zulu = parse_timestamp("start", "2024-03-01T12:00:00.250Z").unwrap();
        assert_eq!(zulu.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let parsed = parse_timestamp("end", "2024-03-01T12:00:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let spaced = parse_timestamp("end", "2024-03-01 12:00:00.5").unwrap();
        assert_eq!(spaced.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn garbage_is_rejected_with_field_name() {
        let err = parse_timestamp("start", "yesterday").unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MalformedTimestamp { field: "start", ref value } if value == "yesterday"
        ));
    }

    #[test]
    fn non_positive_limits_fall_back_to_default() {
        assert_eq!(effective_limit(None), DEFAULT_QUERY_LIMIT);
        assert_eq!(effective_limit(Some(0)), DEFAULT_QUERY_LIMIT);
        assert_eq!(effective_limit(Some(-5)), DEFAULT_QUERY_LIMIT);
        assert_eq!(effective_limit(Some(7)), 7);
    }

    #[test]
    fn filter_params_accept_long_aliases() {
        let params: FilterParams = serde_json::from_str(
            r#"{"start_timestamp":"2024-01-01T00:00:00Z","end_timestamp":"2024-01-02T00:00:00Z","limit":5}"#,
        )
        .unwrap();
        assert_eq!(params.start.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(params.end.as_deref(), Some("2024-01-02T00:00:00Z"));
        assert_eq!(params.limit, Some(5));
    }

    #[test]
    fn blank_bounds_are_unbounded() {
        assert_eq!(parse_bound("start", Some("  ")).unwrap(), None);
        assert_eq!(parse_bound("start", None).unwrap(), None);
    }
}
