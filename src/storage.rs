use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::alert::Alert;
use crate::Timestamp;

/// Periodic per-zone occupancy sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub zone_id: String,
    pub occupancy: usize,
    pub dwell_sessions: usize,
    pub timestamp: Timestamp,
}

/// Anything the persistence sink can be asked to record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Alert(Alert),
    Metric(MetricSample),
}

/// Durable store for alerts and metrics.
///
/// Called from the sink worker only; errors are logged there and never
/// reach the ingestion loop.
pub trait AlertStore: Send {
    fn record(&mut self, record: &Record) -> Result<()>;
}

pub struct SqliteAlertStore {
    conn: Connection,
}

impl SqliteAlertStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              kind TEXT NOT NULL,
              subject TEXT NOT NULL,
              severity TEXT NOT NULL,
              metadata_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              zone_id TEXT NOT NULL,
              occupancy INTEGER NOT NULL,
              dwell_sessions INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_metrics_zone ON metrics(zone_id, created_at_ms);
            "#,
        )?;
        Ok(())
    }

    pub fn alert_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<(String, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, subject, severity FROM alerts ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn metric_count(&self, zone_id: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM metrics WHERE zone_id = ?1",
            params![zone_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

impl AlertStore for SqliteAlertStore {
    fn record(&mut self, record: &Record) -> Result<()> {
        match record {
            Record::Alert(alert) => {
                let created = i64::try_from(alert.timestamp.as_millis())
                    .map_err(|_| anyhow!("alert timestamp exceeds i64 range"))?;
                let metadata_json = serde_json::to_string(&alert.metadata)?;
                self.conn.execute(
                    r#"
                    INSERT INTO alerts(created_at_ms, kind, subject, severity, metadata_json)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![
                        created,
                        alert.kind.as_str(),
                        alert.subject,
                        alert.severity.as_str(),
                        metadata_json
                    ],
                )?;
            }
            Record::Metric(sample) => {
                let created = i64::try_from(sample.timestamp.as_millis())
                    .map_err(|_| anyhow!("metric timestamp exceeds i64 range"))?;
                self.conn.execute(
                    r#"
                    INSERT INTO metrics(created_at_ms, zone_id, occupancy, dwell_sessions)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    params![
                        created,
                        sample.zone_id,
                        sample.occupancy as i64,
                        sample.dwell_sessions as i64
                    ],
                )?;
            }
        }
        Ok(())
    }
}

/// In-memory store; the handle lets callers inspect what was recorded.
#[derive(Clone, Default)]
pub struct MemoryAlertStore {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<Mutex<Vec<Record>>> {
        self.records.clone()
    }
}

impl AlertStore for MemoryAlertStore {
    fn record(&mut self, record: &Record) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertKind, Severity};

    #[test]
    fn sqlite_store_records_alerts_and_metrics() -> Result<()> {
        let mut store = SqliteAlertStore::open(":memory:")?;
        let alert = Alert::new(AlertKind::DwellExceeded, "track:3", Severity::Warning, Timestamp(1_000))
            .with_meta("zone_id", "bathroom");
        store.record(&Record::Alert(alert))?;
        store.record(&Record::Metric(MetricSample {
            zone_id: "room".into(),
            occupancy: 2,
            dwell_sessions: 0,
            timestamp: Timestamp(2_000),
        }))?;

        assert_eq!(store.alert_count()?, 1);
        assert_eq!(store.metric_count("room")?, 1);
        assert_eq!(store.metric_count("bathroom")?, 0);
        let recent = store.recent_alerts(5)?;
        assert_eq!(
            recent,
            vec![("dwell_exceeded".to_string(), "track:3".to_string(), "warning".to_string())]
        );
        Ok(())
    }

    #[test]
    fn memory_store_shares_records_through_handle() -> Result<()> {
        let mut store = MemoryAlertStore::new();
        let handle = store.handle();
        store.record(&Record::Alert(Alert::new(
            AlertKind::Fall,
            "stream:cam",
            Severity::Critical,
            Timestamp(0),
        )))?;
        assert_eq!(handle.lock().unwrap().len(), 1);
        Ok(())
    }
}
