//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP and WebSocket surface of the telemetry service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! REST endpoints for ingestion, queries and reports, plus the `/ws` live feed.

pub mod error;
pub mod rest;
pub mod websocket;

pub use error::ApiError;
pub use rest::{ApiContext, ApiServerBuilder, ApiServerHandle, DEFAULT_NUM_RECORDS};
