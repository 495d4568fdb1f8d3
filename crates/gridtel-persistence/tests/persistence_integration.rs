//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reading store abstraction and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use gridtel_common::NewReading;
use gridtel_persistence::{ReadingQuery, ReadingStore, SqliteReadingStore, StoreMetrics};
use prometheus::Registry;
use tempfile::tempdir;

fn reading(offset_secs: i64) -> NewReading {
    NewReading {
        timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs),
        voltage: 230.0,
        current: 12.5,
        frequency: None,
    }
}

#[tokio::test]
async fn file_store_survives_reopen_and_continues_ids() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nested").join("grid.sqlite3");

    {
        let store = SqliteReadingStore::open(&path)?;
        let stored = store.insert_batch(vec![reading(0), reading(1)]).await?;
        assert_eq!(stored.last().map(|r| r.id), Some(2));
    }

    let reopened = SqliteReadingStore::open(&path)?;
    let existing = reopened.query(ReadingQuery::default()).await?;
    assert_eq!(existing.len(), 2);
    assert_eq!(existing[0].frequency, None);

    let next = reopened.insert(reading(2)).await?;
    assert_eq!(next.id, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_never_share_ids() -> anyhow::Result<()> {
    let store = Arc::new(SqliteReadingStore::open_in_memory()?);
    let mut tasks = Vec::new();
    for task in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .insert_batch((0..5).map(|i| reading(task * 10 + i)).collect())
                .await
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        let batch = task.await??;
        let batch_ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        let mut sorted = batch_ids.clone();
        sorted.sort_unstable();
        assert_eq!(batch_ids, sorted, "ids within a batch follow insertion order");
        for id in batch_ids {
            assert!(ids.insert(id), "duplicate id {id}");
        }
    }
    assert_eq!(ids.len(), 40);
    Ok(())
}

#[tokio::test]
async fn store_metrics_capture_activity() -> anyhow::Result<()> {
    let registry = Arc::new(Registry::new());
    let metrics = StoreMetrics::new(registry.clone())?;
    let store = SqliteReadingStore::open_in_memory()?.with_metrics(metrics);

    store.insert_batch(vec![reading(0), reading(1), reading(2)]).await?;
    store.query(ReadingQuery::latest(1)).await?;
    store.delete_all().await?;

    let families = registry.gather();
    let rows = families
        .iter()
        .find(|family| family.get_name() == "gridtel_store_rows_total")
        .expect("rows counter registered");
    let total: f64 = rows
        .get_metric()
        .iter()
        .map(|metric| metric.get_counter().get_value())
        .sum();
    assert_eq!(total, 6.0);

    let durations = families
        .iter()
        .find(|family| family.get_name() == "gridtel_store_operation_duration_seconds")
        .expect("duration histogram registered");
    assert_eq!(durations.get_metric().len(), 3);
    Ok(())
}
