//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "SQLite-backed reading store served by a dedicated worker thread."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridtel_common::{NewReading, Reading};
use rusqlite::{params, Connection, Row};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::metrics::StoreMetrics;
use crate::{ReadingQuery, ReadingStore, Result, StorageError, DEFAULT_QUERY_LIMIT};

/// Schema steps applied in order; `PRAGMA user_version` records how many ran.
const MIGRATIONS: &[&str] = &["CREATE TABLE IF NOT EXISTS grid_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp_us INTEGER NOT NULL,
        voltage REAL NOT NULL,
        current REAL NOT NULL,
        frequency REAL
    );
    CREATE INDEX IF NOT EXISTS idx_grid_data_timestamp ON grid_data (timestamp_us);"];

const INSERT_SQL: &str =
    "INSERT INTO grid_data (timestamp_us, voltage, current, frequency) VALUES (?1, ?2, ?3, ?4)";

const QUERY_SQL: &str = "SELECT id, timestamp_us, voltage, current, frequency
     FROM grid_data
     WHERE timestamp_us BETWEEN ?1 AND ?2
     ORDER BY timestamp_us DESC, id DESC
     LIMIT ?3";

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if self.sender.send(StoreCommand::Shutdown).is_err() {
                debug!("store worker already stopped");
            }
            if handle.join().is_err() {
                error!("store worker panicked during shutdown");
            }
        }
    }
}

/// Reading store backed by SQLite.
///
/// One worker thread owns the connection; every operation is shipped to it as a
/// closure and runs to completion before the next one starts, so transactions
/// from concurrent callers never interleave. Clones share the same worker.
#[derive(Clone)]
pub struct SqliteReadingStore {
    inner: Arc<StoreInner>,
    location: Arc<str>,
    metrics: Option<StoreMetrics>,
}

impl SqliteReadingStore {
    /// Open (or create) the database file at `path` and apply migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let location = path.display().to_string();
        Self::spawn(location, move || Connection::open(&path))
    }

    /// Open a private in-memory database. Contents vanish with the last clone.
    pub fn open_in_memory() -> Result<Self> {
        Self::spawn(":memory:".to_owned(), Connection::open_in_memory)
    }

    /// Record operation latency and failures into `metrics`.
    pub fn with_metrics(mut self, metrics: StoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Human readable database location.
    pub fn location(&self) -> &str {
        &self.location
    }

    fn spawn<F>(location: String, opener: F) -> Result<Self>
    where
        F: FnOnce() -> rusqlite::Result<Connection> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let worker = thread::Builder::new()
            .name("gridtel-store".into())
            .spawn(move || {
                let mut conn = match opener().map_err(StorageError::from).and_then(|mut conn| {
                    prepare_connection(&mut conn)?;
                    Ok(conn)
                }) {
                    Ok(conn) => conn,
                    Err(err) => {
                        if ready_tx.send(Err(err)).is_err() {
                            debug!("store opener dropped before receiving initialisation error");
                        }
                        return;
                    }
                };

                if ready_tx.send(Ok(())).is_err() {
                    error!("store initialisation receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }

                debug!("store worker shutting down");
            })?;

        ready_rx
            .recv()
            .map_err(|_| StorageError::Open("store worker exited before signalling readiness".into()))?
            .map_err(|err| StorageError::Open(err.to_string()))?;

        info!(location = %location, "reading store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            location: location.into(),
            metrics: None,
        })
    }

    async fn execute<F, T>(&self, operation: &'static str, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                debug!(operation, "store caller dropped before receiving result");
            }
        }));

        let result = match self.inner.sender.send(command) {
            Ok(()) => reply_rx
                .await
                .unwrap_or(Err(StorageError::WorkerUnavailable)),
            Err(_) => Err(StorageError::WorkerUnavailable),
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe(operation, started.elapsed().as_secs_f64(), result.is_ok());
        }
        if let Err(err) = &result {
            warn!(operation, error = %err, "reading store operation failed");
        }
        result
    }

    fn record_rows(&self, operation: &str, rows: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rows(operation, rows);
        }
    }
}

impl std::fmt::Debug for SqliteReadingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteReadingStore")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReadingStore for SqliteReadingStore {
    async fn insert(&self, reading: NewReading) -> Result<Reading> {
        let mut stored = self.insert_batch(vec![reading]).await?;
        stored
            .pop()
            .ok_or_else(|| StorageError::Constraint("insert produced no row".into()))
    }

    async fn insert_batch(&self, readings: Vec<NewReading>) -> Result<Vec<Reading>> {
        if readings.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(position) = readings.iter().position(|reading| !reading.is_finite()) {
            return Err(StorageError::Constraint(format!(
                "reading at batch position {position} has a non-finite value"
            )));
        }

        let stored = self
            .execute("insert", move |conn| {
                let tx = conn.transaction()?;
                let mut stored = Vec::with_capacity(readings.len());
                {
                    let mut stmt = tx.prepare_cached(INSERT_SQL)?;
                    for reading in readings {
                        let micros = reading.timestamp.timestamp_micros();
                        stmt.execute(params![
                            micros,
                            reading.voltage,
                            reading.current,
                            reading.frequency
                        ])?;
                        let id = tx.last_insert_rowid();
                        let mut persisted = reading.with_id(id);
                        persisted.timestamp = from_micros(micros)?;
                        stored.push(persisted);
                    }
                }
                tx.commit()?;
                Ok(stored)
            })
            .await?;

        self.record_rows("insert", stored.len() as u64);
        debug!(
            rows = stored.len(),
            first_id = stored.first().map(|r| r.id),
            last_id = stored.last().map(|r| r.id),
            "reading batch committed"
        );
        Ok(stored)
    }

    async fn query(&self, query: ReadingQuery) -> Result<Vec<Reading>> {
        let limit = if query.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let lower = query.start.map(lower_bound_micros).unwrap_or(i64::MIN);
        let upper = query.end.map(|end| end.timestamp_micros()).unwrap_or(i64::MAX);

        self.execute("query", move |conn| {
            let mut stmt = conn.prepare_cached(QUERY_SQL)?;
            let rows = stmt.query_map(params![lower, upper, limit], reading_from_row)?;
            let mut readings = Vec::new();
            for row in rows {
                readings.push(row?);
            }
            Ok(readings)
        })
        .await
    }

    async fn delete_all(&self) -> Result<u64> {
        let removed = self
            .execute("delete_all", |conn| {
                let removed = conn.execute("DELETE FROM grid_data", [])?;
                Ok(removed as u64)
            })
            .await?;
        self.record_rows("delete_all", removed);
        info!(removed, "all readings deleted");
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        self.execute("health_check", |conn| {
            let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            if one != 1 {
                return Err(StorageError::Constraint(format!(
                    "health probe returned {one}"
                )));
            }
            Ok(())
        })
        .await
    }
}

fn prepare_connection(conn: &mut Connection) -> Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(journal_mode = %mode, "sqlite journal mode configured");
    run_migrations(conn)
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let applied: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let applied = usize::try_from(applied).unwrap_or(0);
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(applied) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", (index + 1) as i64)?;
        tx.commit()?;
        info!(version = index + 1, "reading store schema migrated");
    }
    Ok(())
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    let micros: i64 = row.get(1)?;
    let timestamp = DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, micros))?;
    Ok(Reading {
        id: row.get(0)?,
        timestamp,
        voltage: row.get(2)?,
        current: row.get(3)?,
        frequency: row.get(4)?,
    })
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::Constraint(format!("timestamp {micros}us out of range")))
}

/// Round a lower bound up to whole microseconds so sub-microsecond bounds stay inclusive
/// only of readings at or after them.
fn lower_bound_micros(start: DateTime<Utc>) -> i64 {
    let micros = start.timestamp_micros();
    if start.timestamp_subsec_nanos() % 1_000 != 0 {
        micros.saturating_add(1)
    } else {
        micros
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn reading_at(timestamp: DateTime<Utc>, voltage: f64) -> NewReading {
        NewReading {
            timestamp,
            voltage,
            current: 10.0,
            frequency: Some(50.0),
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn batch_assigns_increasing_ids_in_order() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        let batch = (0..3)
            .map(|i| reading_at(base() + Duration::seconds(i), 220.0 + i as f64))
            .collect();
        let stored = store.insert_batch(batch).await.unwrap();
        let ids: Vec<i64> = stored.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(stored[2].voltage, 222.0);
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_truncates() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        let batch = (0..5)
            .map(|i| reading_at(base() + Duration::seconds(i), 230.0))
            .collect();
        store.insert_batch(batch).await.unwrap();

        let latest = store.query(ReadingQuery::latest(2)).await.unwrap();
        let ids: Vec<i64> = latest.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4]);
    }

    #[tokio::test]
    async fn zero_limit_falls_back_to_default() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        let batch = (0..(DEFAULT_QUERY_LIMIT as i64 + 5))
            .map(|i| reading_at(base() + Duration::milliseconds(i), 230.0))
            .collect();
        store.insert_batch(batch).await.unwrap();
        let readings = store.query(ReadingQuery::latest(0)).await.unwrap();
        assert_eq!(readings.len(), DEFAULT_QUERY_LIMIT);
    }

    #[tokio::test]
    async fn range_bounds_are_inclusive() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        let batch = (0..6)
            .map(|i| reading_at(base() + Duration::minutes(i), 230.0))
            .collect();
        store.insert_batch(batch).await.unwrap();

        let query = ReadingQuery::latest(100).between(
            Some(base() + Duration::minutes(1)),
            Some(base() + Duration::minutes(3)),
        );
        let readings = store.query(query).await.unwrap();
        let ids: Vec<i64> = readings.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 3, 2]);

        let open_ended = ReadingQuery::latest(100).between(Some(base() + Duration::minutes(4)), None);
        assert_eq!(store.query(open_ended).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn timestamps_are_persisted_at_microsecond_precision() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        let precise = base() + Duration::nanoseconds(1_234_567);
        let stored = store.insert(reading_at(precise, 230.0)).await.unwrap();
        assert_eq!(stored.timestamp, base() + Duration::microseconds(1_234));

        let queried = store.query(ReadingQuery::default()).await.unwrap();
        assert_eq!(queried, vec![stored]);
    }

    #[tokio::test]
    async fn non_finite_batch_is_rejected_without_writes() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        let batch = vec![
            reading_at(base(), 230.0),
            reading_at(base(), f64::INFINITY),
        ];
        let err = store.insert_batch(batch).await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
        assert!(store.query(ReadingQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_inside_transaction_rolls_back_whole_batch() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        store
            .execute("install_trigger", |conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_marker BEFORE INSERT ON grid_data
                     WHEN NEW.voltage = 999
                     BEGIN SELECT RAISE(ABORT, 'reject'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let batch = vec![
            reading_at(base(), 230.0),
            reading_at(base() + Duration::seconds(1), 231.0),
            reading_at(base() + Duration::seconds(2), 999.0),
        ];
        let err = store.insert_batch(batch).await.unwrap_err();
        assert!(matches!(err, StorageError::Sqlite(_)), "unexpected error {err:?}");
        assert!(store.query(ReadingQuery::default()).await.unwrap().is_empty());

        let next = store.insert(reading_at(base(), 232.0)).await.unwrap();
        assert_eq!(next.id, 1);
        assert_eq!(store.query(ReadingQuery::default()).await.unwrap(), vec![next]);
    }

    #[tokio::test]
    async fn delete_all_keeps_id_sequence() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        store
            .insert_batch(vec![reading_at(base(), 230.0), reading_at(base(), 231.0)])
            .await
            .unwrap();
        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert!(store.query(ReadingQuery::default()).await.unwrap().is_empty());

        let next = store.insert(reading_at(base(), 232.0)).await.unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn opener_failure_surfaces_as_open_error() {
        let err = SqliteReadingStore::spawn("unreachable".into(), || {
            Err(rusqlite::Error::InvalidQuery)
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::Open(_)), "unexpected error {err:?}");
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let store = SqliteReadingStore::open_in_memory().unwrap();
        store.health_check().await.unwrap();
    }

    #[test]
    fn lower_bound_rounds_up_sub_microsecond_values() {
        assert_eq!(lower_bound_micros(base()), base().timestamp_micros());
        let fractional = base() + Duration::nanoseconds(1_500);
        assert_eq!(lower_bound_micros(fractional), base().timestamp_micros() + 2);
    }
}
