//! SQLite-based state store for the dev agent.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Per-device sync record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSyncRecord {
    /// Device name.
    pub device: String,
    /// Project change time (Unix millis) captured before the last full upload.
    pub last_uploaded_at: Option<i64>,
    /// When the record was written (Unix seconds).
    pub recorded_at: i64,
}

/// SQLite state store.
///
/// The connection sits behind an async mutex so one store can be shared by
/// every device manager in a session.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the last uploaded change time for a device.
    ///
    /// Unknown devices and devices recorded without a change time both yield
    /// `None`.
    pub async fn last_uploaded_at(&self, device: &str) -> Result<Option<i64>, StateStoreError> {
        Ok(self
            .get_device(device)
            .await?
            .and_then(|record| record.last_uploaded_at))
    }

    /// Record the change time captured before a full upload.
    pub async fn set_last_uploaded_at(
        &self,
        device: &str,
        changed_at: Option<i64>,
    ) -> Result<(), StateStoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO device_sync (device, last_uploaded_at, recorded_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(device) DO UPDATE SET
                last_uploaded_at = excluded.last_uploaded_at,
                recorded_at = excluded.recorded_at
            "#,
            params![device, changed_at, now],
        )?;

        debug!(device = %device, changed_at = ?changed_at, "Recorded device upload");
        Ok(())
    }

    /// Get a device record.
    pub async fn get_device(
        &self,
        device: &str,
    ) -> Result<Option<DeviceSyncRecord>, StateStoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT device, last_uploaded_at, recorded_at FROM device_sync WHERE device = ?1",
        )?;

        stmt.query_row(params![device], |row| {
            Ok(DeviceSyncRecord {
                device: row.get(0)?,
                last_uploaded_at: row.get(1)?,
                recorded_at: row.get(2)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// List all device records.
    pub async fn list_devices(&self) -> Result<Vec<DeviceSyncRecord>, StateStoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT device, last_uploaded_at, recorded_at FROM device_sync ORDER BY device",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(DeviceSyncRecord {
                    device: row.get(0)?,
                    last_uploaded_at: row.get(1)?,
                    recorded_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Delete a device record.
    pub async fn forget_device(&self, device: &str) -> Result<(), StateStoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM device_sync WHERE device = ?1", params![device])?;
        Ok(())
    }
}

/// Initialize database schema.
fn init_schema(conn: &Connection) -> Result<(), StateStoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS device_sync (
            device TEXT PRIMARY KEY,
            last_uploaded_at INTEGER,
            recorded_at INTEGER NOT NULL
        );
        "#,
    )?;

    debug!("State store schema initialized");
    Ok(())
}
