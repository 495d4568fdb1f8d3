//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reading store abstraction and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the reading store.
#[derive(Clone)]
pub struct StoreMetrics {
    operations_failed: IntCounterVec,
    rows_written: IntCounterVec,
    operation_duration: HistogramVec,
}

impl StoreMetrics {
    /// Register all store metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let operations_failed = IntCounterVec::new(
            Opts::new(
                "gridtel_store_operations_failed_total",
                "Total number of reading store operations that returned an error",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(operations_failed.clone()))?;

        let rows_written = IntCounterVec::new(
            Opts::new(
                "gridtel_store_rows_total",
                "Total number of rows inserted or deleted by the reading store",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(rows_written.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "gridtel_store_operation_duration_seconds",
            "Duration of reading store operations including worker queueing",
        )
        .buckets(prometheus::exponential_buckets(0.0001, 2.0, 14)?);
        let operation_duration = HistogramVec::new(histogram_opts, &["operation"])?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            operations_failed,
            rows_written,
            operation_duration,
        })
    }

    /// Record the outcome of one store operation.
    pub fn observe(&self, operation: &str, seconds: f64, succeeded: bool) {
        self.operation_duration
            .with_label_values(&[operation])
            .observe(seconds);
        if !succeeded {
            self.operations_failed.with_label_values(&[operation]).inc();
        }
    }

    /// Add to the row counter for an insert or delete operation.
    pub fn record_rows(&self, operation: &str, rows: u64) {
        self.rows_written
            .with_label_values(&[operation])
            .inc_by(rows);
    }
}

impl std::fmt::Debug for StoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMetrics").finish_non_exhaustive()
    }
}
