//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Generate, persist and broadcast batches of readings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use gridtel_common::{Clock, NewReading, Reading};
use gridtel_metrics::PipelineMetrics;
use gridtel_persistence::ReadingStore;
use gridtel_sim::ReadingSource;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{GridError, ValidationError};
use crate::registry::SubscriberRegistry;

/// Largest batch accepted when no explicit limit is configured.
pub const DEFAULT_MAX_BATCH: usize = 10_000;

/// Drives one ingestion cycle: generate, commit as a single batch, then fan out.
///
/// Nothing is broadcast unless the whole batch committed, so subscribers only
/// ever observe durable readings.
pub struct IngestionCoordinator {
    store: Arc<dyn ReadingStore>,
    source: Mutex<Box<dyn ReadingSource>>,
    registry: SubscriberRegistry,
    clock: Arc<dyn Clock>,
    max_batch: usize,
    metrics: Option<PipelineMetrics>,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        source: Box<dyn ReadingSource>,
        registry: SubscriberRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            source: Mutex::new(source),
            registry,
            clock,
            max_batch: DEFAULT_MAX_BATCH,
            metrics: None,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Generate `count` readings, persist them atomically and broadcast the
    /// committed readings in insertion order as one batch per subscriber.
    pub async fn ingest(&self, count: usize) -> Result<Vec<Reading>, GridError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.max_batch {
            self.record_failure();
            return Err(ValidationError::BatchTooLarge {
                requested: count,
                max: self.max_batch,
            }
            .into());
        }

        let candidates = self.generate(count);
        let stored = match self.store.insert_batch(candidates).await {
            Ok(stored) => stored,
            Err(err) => {
                self.record_failure();
                warn!(error = %err, count, "ingest batch rolled back");
                return Err(err.into());
            }
        };

        let anomalous = stored.iter().filter(|reading| reading.is_anomalous()).count();
        if let Some(metrics) = &self.metrics {
            metrics.record_ingested(stored.len(), anomalous);
        }

        let messages: Vec<Arc<str>> = stored
            .iter()
            .filter_map(|reading| match serde_json::to_string(reading) {
                Ok(json) => Some(Arc::from(json)),
                Err(err) => {
                    warn!(id = reading.id, error = %err, "unable to encode reading for broadcast");
                    None
                }
            })
            .collect();
        let report = self.registry.broadcast_batch(Arc::from(messages));

        info!(
            count = stored.len(),
            anomalous,
            first_id = stored.first().map(|r| r.id),
            last_id = stored.last().map(|r| r.id),
            delivered = report.delivered,
            dropped = report.dropped,
            "readings ingested"
        );
        Ok(stored)
    }

    fn generate(&self, count: usize) -> Vec<NewReading> {
        let mut source = self.source.lock();
        let batch: Vec<NewReading> = (0..count)
            .map(|_| source.next_reading(self.clock.now()))
            .collect();
        debug!(count, "candidate readings generated");
        batch
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_ingest_failure();
        }
    }
}

impl std::fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("registry", &self.registry)
            .field("max_batch", &self.max_batch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridtel_common::ManualClock;
    use gridtel_persistence::SqliteReadingStore;
    use gridtel_sim::{GeneratorProfile, ReadingGenerator};

    fn coordinator() -> IngestionCoordinator {
        let store = Arc::new(SqliteReadingStore::open_in_memory().unwrap());
        IngestionCoordinator::new(
            store,
            Box::new(ReadingGenerator::new(GeneratorProfile::default(), 11)),
            SubscriberRegistry::new(16),
            Arc::new(ManualClock::new(chrono::Utc::now())),
        )
    }

    #[tokio::test]
    async fn zero_count_is_a_no_op() {
        let coordinator = coordinator();
        let mut subscription = coordinator.registry().register();
        assert!(coordinator.ingest(0).await.unwrap().is_empty());
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn oversized_batches_are_rejected() {
        let coordinator = coordinator().with_max_batch(5);
        let err = coordinator.ingest(6).await.unwrap_err();
        assert!(matches!(
            err,
            GridError::Validation(ValidationError::BatchTooLarge { requested: 6, max: 5 })
        ));
    }

    #[tokio::test]
    async fn ingest_returns_count_readings_with_increasing_ids() {
        let coordinator = coordinator();
        let first = coordinator.ingest(4).await.unwrap();
        let second = coordinator.ingest(3).await.unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 3);
        let ids: Vec<i64> = first.iter().chain(&second).map(|r| r.id).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn batch_beyond_queue_capacity_reaches_idle_subscriber() {
        let coordinator = coordinator();
        let mut subscription = coordinator.registry().register();
        let stored = coordinator.ingest(64).await.unwrap();

        assert_eq!(coordinator.registry().len(), 1);
        let mut ids = Vec::new();
        while let Some(message) = subscription.try_recv() {
            let reading: Reading = serde_json::from_str(&message).unwrap();
            ids.push(reading.id);
        }
        let expected: Vec<i64> = stored.iter().map(|r| r.id).collect();
        assert_eq!(ids, expected);
    }
}
