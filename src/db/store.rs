//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::qos::QosEntity;
use crate::scheduler::{TriggerConfig, TriggerKey};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Services ---

    /// Add a new service and return it with its assigned ID.
    pub fn add_service(&self, endpoint: &str) -> Result<Service, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO services (endpoint) VALUES (?1)",
            params![endpoint],
        )?;
        Ok(Service {
            id: conn.last_insert_rowid(),
            endpoint: endpoint.to_string(),
        })
    }

    /// Get a service by ID.
    pub fn get_service(&self, id: i64) -> Result<Option<Service>, DbError> {
        let conn = self.conn()?;
        let service = conn
            .query_row(
                "SELECT id, endpoint FROM services WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Service {
                        id: row.get(0)?,
                        endpoint: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(service)
    }

    /// Find a service by its endpoint address.
    pub fn find_service(&self, endpoint: &str) -> Result<Option<Service>, DbError> {
        let conn = self.conn()?;
        let service = conn
            .query_row(
                "SELECT id, endpoint FROM services WHERE endpoint = ?1",
                params![endpoint],
                |row| {
                    Ok(Service {
                        id: row.get(0)?,
                        endpoint: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(service)
    }

    /// Get all services.
    pub fn get_services(&self) -> Result<Vec<Service>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, endpoint FROM services ORDER BY id")?;
        let services = stmt
            .query_map([], |row| {
                Ok(Service {
                    id: row.get(0)?,
                    endpoint: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(services)
    }

    /// Delete a service together with its processes, triggers and measurements.
    pub fn delete_service(&self, id: i64) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM measurements WHERE process_id IN (SELECT id FROM processes WHERE service_id = ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM triggers WHERE process_id IN (SELECT id FROM processes WHERE service_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM processes WHERE service_id = ?1", params![id])?;
        tx.execute("DELETE FROM services WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Processes ---

    /// Add a new process and return its ID.
    pub fn add_process(&self, process: &mut Process) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO processes (service_id, identifier, test_request, error_count, in_error) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                process.service_id,
                process.identifier,
                process.test_request,
                process.error_count,
                process.in_error,
            ],
        )?;
        let id = conn.last_insert_rowid();
        process.id = id;
        Ok(id)
    }

    /// Get a process by its service and identifier.
    pub fn get_process(&self, service_id: i64, identifier: &str) -> Result<Option<Process>, DbError> {
        let conn = self.conn()?;
        let process = conn
            .query_row(
                "SELECT id, service_id, identifier, test_request, error_count, in_error FROM processes WHERE service_id = ?1 AND identifier = ?2",
                params![service_id, identifier],
                process_from_row,
            )
            .optional()?;
        Ok(process)
    }

    /// Get all processes of a service.
    pub fn get_processes(&self, service_id: i64) -> Result<Vec<Process>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_id, identifier, test_request, error_count, in_error FROM processes WHERE service_id = ?1 ORDER BY id",
        )?;
        let processes = stmt
            .query_map(params![service_id], process_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(processes)
    }

    /// Get every process of every service.
    pub fn get_all_processes(&self) -> Result<Vec<Process>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_id, identifier, test_request, error_count, in_error FROM processes ORDER BY id",
        )?;
        let processes = stmt
            .query_map([], process_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(processes)
    }

    /// Overwrite the error state of a process.
    pub fn update_process_state(&self, process_id: i64, error_count: u32, in_error: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE processes SET error_count = ?1, in_error = ?2 WHERE id = ?3",
            params![error_count, in_error, process_id],
        )?;
        Ok(())
    }

    /// Delete a process with its triggers and measurements.
    pub fn delete_process(&self, process_id: i64) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM measurements WHERE process_id = ?1", params![process_id])?;
        tx.execute("DELETE FROM triggers WHERE process_id = ?1", params![process_id])?;
        tx.execute("DELETE FROM processes WHERE id = ?1", params![process_id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Triggers ---

    /// Insert or replace a saved trigger.
    pub fn save_trigger(&self, process_id: i64, trigger: &TriggerConfig) -> Result<(), DbError> {
        let key = trigger
            .key()
            .ok_or_else(|| DbError::Corrupt("cannot persist an unsaved trigger".to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO triggers (name, trigger_group, process_id, start_time, end_time, interval_count, interval_unit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name, trigger_group) DO UPDATE SET
             process_id=excluded.process_id, start_time=excluded.start_time, end_time=excluded.end_time,
             interval_count=excluded.interval_count, interval_unit=excluded.interval_unit",
            params![
                key.name,
                key.group,
                process_id,
                format_db_time(trigger.start()),
                format_db_time(trigger.end()),
                trigger.interval(),
                trigger.unit().as_str(),
            ],
        )?;
        Ok(())
    }

    /// Get a saved trigger and the process it belongs to.
    pub fn get_trigger(&self, key: &TriggerKey) -> Result<Option<(i64, TriggerConfig)>, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT name, trigger_group, process_id, start_time, end_time, interval_count, interval_unit
                 FROM triggers WHERE name = ?1 AND trigger_group = ?2",
                params![key.name, key.group],
                TriggerRow::from_row,
            )
            .optional()?;

        row.map(|r| r.to_config().map(|config| (r.process_id, config)))
            .transpose()
    }

    /// Get all saved triggers of a process.
    pub fn get_triggers(&self, process_id: i64) -> Result<Vec<TriggerConfig>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, trigger_group, process_id, start_time, end_time, interval_count, interval_unit
             FROM triggers WHERE process_id = ?1 ORDER BY trigger_group, name",
        )?;
        let rows = stmt
            .query_map(params![process_id], TriggerRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.iter().map(TriggerRow::to_config).collect()
    }

    /// Delete a saved trigger. Returns whether it existed.
    pub fn delete_trigger(&self, key: &TriggerKey) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM triggers WHERE name = ?1 AND trigger_group = ?2",
            params![key.name, key.group],
        )?;
        Ok(deleted > 0)
    }

    // --- Measurements ---

    /// Insert a measurement and update its process's error state atomically.
    pub fn record_measurement(
        &self,
        measurement: &mut Measurement,
        error_count: u32,
        in_error: bool,
    ) -> Result<i64, DbError> {
        let entities = serde_json::to_string(&measurement.entities)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO measurements (process_id, time, entities) VALUES (?1, ?2, ?3)",
            params![measurement.process_id, format_db_time(measurement.time), entities],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE processes SET error_count = ?1, in_error = ?2 WHERE id = ?3",
            params![error_count, in_error, measurement.process_id],
        )?;
        tx.commit()?;

        measurement.id = id;
        Ok(id)
    }

    /// Get the newest measurements of a process, newest first.
    pub fn get_measurements(&self, process_id: i64, limit: usize) -> Result<Vec<Measurement>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, process_id, time, entities FROM measurements
             WHERE process_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![process_id, clamp_limit(limit)], MeasurementRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter().map(MeasurementRow::into_measurement).collect()
    }

    /// Get the newest measurements across all processes of a service, newest first.
    pub fn get_service_measurements(&self, service_id: i64, limit: usize) -> Result<Vec<Measurement>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.process_id, m.time, m.entities FROM measurements m
             JOIN processes p ON m.process_id = p.id
             WHERE p.service_id = ?1 ORDER BY m.time DESC, m.id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![service_id, clamp_limit(limit)], MeasurementRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter().map(MeasurementRow::into_measurement).collect()
    }

    /// Delete all measurements of a process. Returns the number deleted.
    pub fn delete_measurements(&self, process_id: i64) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM measurements WHERE process_id = ?1",
            params![process_id],
        )?)
    }

    /// Delete measurements of a process taken before a cutoff time.
    pub fn delete_process_measurements_before(
        &self,
        process_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM measurements WHERE process_id = ?1 AND time < ?2",
            params![process_id, format_db_time(cutoff)],
        )?)
    }

    /// Delete measurements of every process taken before a cutoff time.
    pub fn delete_measurements_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM measurements WHERE time < ?1",
            params![format_db_time(cutoff)],
        )?)
    }
}

fn process_from_row(row: &Row<'_>) -> SqlResult<Process> {
    Ok(Process {
        id: row.get(0)?,
        service_id: row.get(1)?,
        identifier: row.get(2)?,
        test_request: row.get(3)?,
        error_count: row.get(4)?,
        in_error: row.get(5)?,
    })
}

struct TriggerRow {
    name: String,
    group: String,
    process_id: i64,
    start: String,
    end: String,
    interval: i64,
    unit: String,
}

impl TriggerRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            name: row.get(0)?,
            group: row.get(1)?,
            process_id: row.get(2)?,
            start: row.get(3)?,
            end: row.get(4)?,
            interval: row.get(5)?,
            unit: row.get(6)?,
        })
    }

    fn to_config(&self) -> Result<TriggerConfig, DbError> {
        let start = parse_db_time(&self.start)
            .ok_or_else(|| DbError::Corrupt(format!("bad trigger start: {}", self.start)))?;
        let end = parse_db_time(&self.end)
            .ok_or_else(|| DbError::Corrupt(format!("bad trigger end: {}", self.end)))?;
        let unit = self
            .unit
            .parse()
            .map_err(|e| DbError::Corrupt(format!("trigger {}: {}", self.name, e)))?;

        TriggerConfig::new(start, end, self.interval, unit)
            .map(|config| config.with_key(TriggerKey::new(&self.name, &self.group)))
            .map_err(|e| DbError::Corrupt(format!("trigger {}: {}", self.name, e)))
    }
}

struct MeasurementRow {
    id: i64,
    process_id: i64,
    time: String,
    entities: String,
}

impl MeasurementRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            process_id: row.get(1)?,
            time: row.get(2)?,
            entities: row.get(3)?,
        })
    }

    fn into_measurement(self) -> Result<Measurement, DbError> {
        let time = parse_db_time(&self.time)
            .ok_or_else(|| DbError::Corrupt(format!("bad measurement time: {}", self.time)))?;
        let entities: Vec<QosEntity> = serde_json::from_str(&self.entities)?;
        Ok(Measurement {
            id: self.id,
            process_id: self.process_id,
            time,
            entities,
        })
    }
}

fn clamp_limit(limit: usize) -> i64 {
    limit.min(i64::MAX as usize) as i64
}

/// Format a datetime for storage. Fixed width, so text order is time order.
fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
