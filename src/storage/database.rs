//! SQLite reading and alert log

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::ReadingSink;
use crate::analysis::{AlertEvent, AlertStatus, Reading};

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL,
    track_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT NOT NULL,
    image_ref TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_readings_region ON readings (source_id, track_id);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL,
    track_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL,
    reading REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_region ON alerts (source_id, track_id);
";

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn status_from_str(value: &str) -> Result<AlertStatus> {
    match value {
        "low" => Ok(AlertStatus::Low),
        "high" => Ok(AlertStatus::High),
        _ => Err(anyhow!("unknown alert status '{value}'")),
    }
}

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL mode")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        info!("Database initialized at {:?}", path);
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open SQLite database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .context("Failed to read user_version pragma")?;
        if version > SCHEMA_VERSION {
            bail!(
                "database version ({}) is newer than supported schema ({})",
                version,
                SCHEMA_VERSION
            );
        }
        conn.execute_batch(SCHEMA).context("Failed to create tables")?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .context("Failed to update user_version pragma")?;
        Ok(())
    }

    pub fn insert_reading(&self, source_id: &str, track_id: u64, reading: &Reading) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO readings (source_id, track_id, timestamp, value, unit, image_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                source_id,
                to_i64(track_id)?,
                reading.timestamp.to_rfc3339(),
                reading.value,
                reading.unit,
                reading.image_ref
            ],
        )
        .context("Failed to insert reading")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_alert(&self, source_id: &str, track_id: u64, alert: &AlertEvent) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alerts (source_id, track_id, timestamp, status, reading)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                source_id,
                to_i64(track_id)?,
                alert.timestamp.to_rfc3339(),
                alert.status.as_str(),
                alert.reading
            ],
        )
        .context("Failed to insert alert")?;
        Ok(conn.last_insert_rowid())
    }

    /// Readings of one region, oldest first
    pub fn readings(&self, source_id: &str, track_id: u64) -> Result<Vec<Reading>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, value, unit, image_ref FROM readings
             WHERE source_id = ?1 AND track_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![source_id, to_i64(track_id)?], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut readings = Vec::new();
        for row in rows {
            let (timestamp, value, unit, image_ref) = row?;
            readings.push(Reading {
                timestamp: parse_datetime(&timestamp)?,
                value,
                unit,
                image_ref,
            });
        }
        Ok(readings)
    }

    /// Alert history of one region, oldest first
    pub fn alerts(&self, source_id: &str, track_id: u64) -> Result<Vec<AlertEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, status, reading FROM alerts
             WHERE source_id = ?1 AND track_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![source_id, to_i64(track_id)?], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut alerts = Vec::new();
        for row in rows {
            let (timestamp, status, reading) = row?;
            alerts.push(AlertEvent {
                status: status_from_str(&status)?,
                reading,
                timestamp: parse_datetime(&timestamp)?,
            });
        }
        Ok(alerts)
    }
}

#[async_trait]
impl ReadingSink for Database {
    async fn record(&self, source_id: &str, track_id: u64, reading: &Reading) -> Result<()> {
        let db = self.clone();
        let source_id = source_id.to_string();
        let reading = reading.clone();
        tokio::task::spawn_blocking(move || db.insert_reading(&source_id, track_id, &reading))
            .await
            .context("database worker join failed")??;
        Ok(())
    }

    async fn notify(&self, source_id: &str, track_id: u64, alert: &AlertEvent) -> Result<()> {
        let db = self.clone();
        let source_id = source_id.to_string();
        let alert = alert.clone();
        tokio::task::spawn_blocking(move || db.insert_alert(&source_id, track_id, &alert))
            .await
            .context("database worker join failed")??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn reading(value: f64) -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            value,
            unit: "psi".to_string(),
            image_ref: "crops/a.png".to_string(),
        }
    }

    #[test]
    fn test_readings_are_appended_per_region() {
        let db = Database::open_in_memory().unwrap();
        db.insert_reading("boiler", 1, &reading(10.0)).unwrap();
        db.insert_reading("boiler", 1, &reading(12.5)).unwrap();
        db.insert_reading("boiler", 2, &reading(99.0)).unwrap();

        let readings = db.readings("boiler", 1).unwrap();
        assert_eq!(readings, vec![reading(10.0), reading(12.5)]);
        assert_eq!(db.readings("boiler", 2).unwrap().len(), 1);
        assert!(db.readings("yard", 1).unwrap().is_empty());
    }

    #[test]
    fn test_alert_history() {
        let db = Database::open_in_memory().unwrap();
        let alert = AlertEvent {
            status: AlertStatus::High,
            reading: 95.0,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        db.insert_alert("boiler", 3, &alert).unwrap();
        assert_eq!(db.alerts("boiler", 3).unwrap(), vec![alert]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("readings.db");
        {
            let db = Database::open(&path).unwrap();
            db.insert_reading("boiler", 1, &reading(1.0)).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.readings("boiler", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_track_id_out_of_range() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_reading("boiler", u64::MAX, &reading(1.0)).is_err());
    }

    #[tokio::test]
    async fn test_sink_writes_through() {
        let db = Database::open_in_memory().unwrap();
        db.record("boiler", 7, &reading(3.0)).await.unwrap();
        assert_eq!(db.readings("boiler", 7).unwrap().len(), 1);
    }
}
