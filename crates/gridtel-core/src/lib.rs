//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Ingestion, broadcast, query, and report services."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core services of the gridtel pipeline. Readings are persisted in batches and
//! fanned out to live subscribers; the read side answers queries and reports.

pub mod error;
pub mod ingest;
pub mod query;
pub mod registry;
pub mod report;

pub use error::{GridError, ServiceError, ValidationError};
pub use ingest::{IngestionCoordinator, DEFAULT_MAX_BATCH};
pub use query::{parse_timestamp, FilterParams, QueryService};
pub use registry::{BroadcastReport, MessageBatch, SubscriberId, SubscriberRegistry, Subscription};
pub use report::{build_prompt, HttpTextGenerator, ReportService, TextGenerator};
