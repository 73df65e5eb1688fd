//! Telemetry time-series store.
//!
//! Persists `{temperature, output, timestamp, pid_mode}` samples to a local
//! SQLite database. The database lives on flash with limited write
//! endurance, so samples are buffered and flushed in batches, and the
//! control loop's smart recording policy keeps the write rate low while the
//! machine idles.
//!
//! # Storage layout
//!
//! A single table `telemetry` is created (if it does not already exist):
//!
//! | column      | type    | description                          |
//! |-------------|---------|--------------------------------------|
//! | timestamp   | INTEGER | milliseconds since the Unix epoch    |
//! | temperature | REAL    | boiler temperature in Celsius        |
//! | output      | REAL    | commanded heater output, 0..100      |
//! | pid_mode    | TEXT    | `"normal"` or `"recovery"`           |
//!
//! indexed by `timestamp`.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, warn};

use crema_types::{PidMode, TelemetryRecord};

/// Buffered samples per batched write.
pub const BATCH_SIZE: usize = 10;
/// Default retention horizon for the hourly prune.
pub const RETENTION_DAYS: i64 = 7;

/// In-memory spill bound while the database is unavailable; oldest samples
/// are dropped beyond this.
const SPILL_CAP_BATCHES: usize = 10;

const MS_PER_DAY: i64 = 86_400_000;
const MS_PER_HOUR: i64 = 3_600_000;

/// Errors from telemetry persistence.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// SQLite-backed, batch-buffered telemetry store.
///
/// Safe for concurrent access from the control loop (enqueue/flush) and the
/// hourly retention sweep (prune).
pub struct TelemetryStore {
    conn: Mutex<Connection>,
    buffer: Mutex<Vec<TelemetryRecord>>,
    batch_size: usize,
}

impl TelemetryStore {
    /// Open (or create) a persistent database at `path`.
    pub fn open(path: &str) -> Result<Self, TelemetryError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, TelemetryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, TelemetryError> {
        let store = Self {
            conn: Mutex::new(conn),
            buffer: Mutex::new(Vec::with_capacity(BATCH_SIZE)),
            batch_size: BATCH_SIZE,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Override the flush batch size (builder-style). Deployments that need
    /// per-sample durability set this to 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn init_schema(&self) -> Result<(), TelemetryError> {
        let conn = self.conn.lock().expect("telemetry conn poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS telemetry (
                timestamp   INTEGER NOT NULL,
                temperature REAL NOT NULL,
                output      REAL NOT NULL,
                pid_mode    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_telemetry_timestamp
                ON telemetry (timestamp);",
        )?;
        Ok(())
    }

    /// Buffer one sample; flushes automatically once a full batch has
    /// accumulated.
    ///
    /// Never fails: a flush error keeps the samples buffered (bounded, with
    /// the oldest dropped beyond the spill cap) so that control is never
    /// gated on telemetry.
    pub fn enqueue(&self, record: TelemetryRecord) {
        let should_flush = {
            let mut buffer = self.buffer.lock().expect("telemetry buffer poisoned");
            buffer.push(record);
            let cap = self.batch_size * SPILL_CAP_BATCHES;
            if buffer.len() > cap {
                let excess = buffer.len() - cap;
                buffer.drain(..excess);
                warn!(dropped = excess, "telemetry spill cap reached; dropped oldest samples");
            }
            buffer.len() >= self.batch_size
        };
        if should_flush {
            if let Err(e) = self.flush() {
                warn!(error = %e, "telemetry batch flush failed; samples retained in memory");
            }
        }
    }

    /// Write all buffered samples in one transaction. Called on every full
    /// batch and synchronously on graceful shutdown.
    pub fn flush(&self) -> Result<usize, TelemetryError> {
        let drained: Vec<TelemetryRecord> = {
            let mut buffer = self.buffer.lock().expect("telemetry buffer poisoned");
            if buffer.is_empty() {
                return Ok(0);
            }
            buffer.drain(..).collect()
        };

        let written = drained.len();
        let mut conn = self.conn.lock().expect("telemetry conn poisoned");
        let result = (|| -> Result<(), rusqlite::Error> {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO telemetry (timestamp, temperature, output, pid_mode)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for record in &drained {
                    stmt.execute(params![
                        record.timestamp_ms,
                        record.temperature,
                        record.output_percent,
                        mode_label(record.pid_mode),
                    ])?;
                }
            }
            tx.commit()
        })();
        drop(conn);

        match result {
            Ok(()) => {
                debug!(written, "telemetry batch flushed");
                Ok(written)
            }
            Err(e) => {
                self.restore(drained);
                Err(e.into())
            }
        }
    }

    /// Put failed-to-flush samples back at the front of the buffer.
    fn restore(&self, mut drained: Vec<TelemetryRecord>) {
        let mut buffer = self.buffer.lock().expect("telemetry buffer poisoned");
        drained.extend(buffer.drain(..));
        *buffer = drained;
    }

    /// Up to `limit` most-recent records, optionally restricted to
    /// `timestamp > since_ms`, returned ascending by timestamp.
    pub fn history(
        &self,
        limit: usize,
        since_ms: Option<i64>,
    ) -> Result<Vec<TelemetryRecord>, TelemetryError> {
        let conn = self.conn.lock().expect("telemetry conn poisoned");
        let mut stmt = conn.prepare(
            "SELECT timestamp, temperature, output, pid_mode
             FROM telemetry
             WHERE timestamp > ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since_ms.unwrap_or(i64::MIN), limit as i64], |row| {
            let label: String = row.get(3)?;
            Ok(TelemetryRecord {
                timestamp_ms: row.get(0)?,
                temperature: row.get(1)?,
                output_percent: row.get(2)?,
                pid_mode: parse_mode(&label),
            })
        })?;

        let mut records = rows.collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    /// Stock query: up to 600 most-recent records from the last hour,
    /// chronological.
    pub fn recent(&self) -> Result<Vec<TelemetryRecord>, TelemetryError> {
        let cutoff = Utc::now().timestamp_millis() - MS_PER_HOUR;
        self.history(600, Some(cutoff))
    }

    /// Stock query: all records with `timestamp > since_ms`, ascending.
    pub fn since(&self, since_ms: i64) -> Result<Vec<TelemetryRecord>, TelemetryError> {
        self.history(usize::MAX >> 1, Some(since_ms))
    }

    /// Delete everything older than the retention horizon; returns the
    /// number of reaped records. Run once per hour.
    pub fn prune(&self, retention_days: i64) -> Result<usize, TelemetryError> {
        let cutoff = Utc::now().timestamp_millis() - retention_days * MS_PER_DAY;
        let conn = self.conn.lock().expect("telemetry conn poisoned");
        let reaped = conn.execute("DELETE FROM telemetry WHERE timestamp < ?1", params![cutoff])?;
        if reaped > 0 {
            debug!(reaped, retention_days, "telemetry retention sweep");
        }
        Ok(reaped)
    }

    /// Number of samples currently buffered in memory.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().expect("telemetry buffer poisoned").len()
    }
}

fn mode_label(mode: PidMode) -> &'static str {
    match mode {
        PidMode::Normal => "normal",
        PidMode::Recovery => "recovery",
    }
}

fn parse_mode(label: &str) -> PidMode {
    match label {
        "recovery" => PidMode::Recovery,
        _ => PidMode::Normal,
    }
}
