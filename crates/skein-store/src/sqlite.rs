use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::traits::ActivationStore;
use skein_core::types::{Activation, ActivationPatch, RequestId, Transit};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS activations (
        request_id TEXT PRIMARY KEY,
        record TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS counters (
        request_id TEXT NOT NULL,
        name TEXT NOT NULL,
        value INTEGER NOT NULL,
        PRIMARY KEY (request_id, name)
    );

    CREATE TABLE IF NOT EXISTS lists (
        request_id TEXT NOT NULL,
        name TEXT NOT NULL,
        seq INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (request_id, name, seq)
    );

    CREATE TABLE IF NOT EXISTS transits (
        request_id TEXT NOT NULL,
        from_id TEXT NOT NULL,
        to_id TEXT NOT NULL,
        message_id TEXT NOT NULL DEFAULT '',
        record TEXT NOT NULL,
        PRIMARY KEY (request_id, from_id, to_id, message_id)
    );

    CREATE INDEX IF NOT EXISTS idx_transits_to
        ON transits(request_id, to_id);";

/// SQLite-backed activation store.
///
/// The single serialized connection makes every operation atomic with
/// respect to the others, which covers the linearizable-increment and
/// consistent-existence requirements of the contract.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SkeinError::Store(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(|e| SkeinError::Store(e.to_string()))?;

        // WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| SkeinError::Store(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SkeinError::Store(e.to_string()))?;

        debug!(path = %path.display(), "SQLite activation store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| SkeinError::Store(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SkeinError::Store(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn store_err(e: rusqlite::Error) -> SkeinError {
    SkeinError::Store(e.to_string())
}

fn load_activation(conn: &Connection, request_id: &str) -> Result<Option<Activation>> {
    let mut stmt = conn
        .prepare("SELECT record FROM activations WHERE request_id = ?1")
        .map_err(store_err)?;
    let mut rows = stmt
        .query_map(params![request_id], |row| row.get::<_, String>(0))
        .map_err(store_err)?;

    match rows.next() {
        Some(record) => {
            let record = record.map_err(store_err)?;
            Ok(Some(serde_json::from_str(&record)?))
        }
        None => Ok(None),
    }
}

fn save_activation(conn: &Connection, activation: &Activation) -> Result<()> {
    let record = serde_json::to_string(activation)?;
    conn.execute(
        "INSERT INTO activations (request_id, record) VALUES (?1, ?2)
         ON CONFLICT(request_id) DO UPDATE SET record = excluded.record",
        params![activation.request_id.0, record],
    )
    .map_err(store_err)?;
    Ok(())
}

impl ActivationStore for SqliteStore {
    fn create(&self, activation: &Activation) -> BoxFuture<'_, Result<()>> {
        let activation = activation.clone();
        Box::pin(async move { save_activation(&self.lock(), &activation) })
    }

    fn get(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Option<Activation>>> {
        let key = request_id.0.clone();
        Box::pin(async move { load_activation(&self.lock(), &key) })
    }

    fn merge(&self, request_id: &RequestId, patch: ActivationPatch) -> BoxFuture<'_, Result<()>> {
        let key = request_id.0.clone();
        Box::pin(async move {
            let conn = self.lock();
            if let Some(mut activation) = load_activation(&conn, &key)? {
                activation.apply(patch);
                save_activation(&conn, &activation)?;
            }
            Ok(())
        })
    }

    fn exists(&self, request_id: &RequestId) -> BoxFuture<'_, Result<bool>> {
        let key = request_id.0.clone();
        Box::pin(async move {
            let conn = self.lock();
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM activations WHERE request_id = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .map_err(store_err)?;
            Ok(count > 0)
        })
    }

    fn increment(&self, request_id: &RequestId, counter: &str) -> BoxFuture<'_, Result<i64>> {
        let key = request_id.0.clone();
        let name = counter.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let value: i64 = conn
                .query_row(
                    "INSERT INTO counters (request_id, name, value) VALUES (?1, ?2, 1)
                     ON CONFLICT(request_id, name) DO UPDATE SET value = value + 1
                     RETURNING value",
                    params![key, name],
                    |row| row.get(0),
                )
                .map_err(store_err)?;
            Ok(value)
        })
    }

    fn counter(&self, request_id: &RequestId, counter: &str) -> BoxFuture<'_, Result<i64>> {
        let key = request_id.0.clone();
        let name = counter.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM counters WHERE request_id = ?1 AND name = ?2",
                    params![key, name],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(store_err(other)),
                })?;
            Ok(value.unwrap_or(0))
        })
    }

    fn append(
        &self,
        request_id: &RequestId,
        key: &str,
        value: serde_json::Value,
    ) -> BoxFuture<'_, Result<i64>> {
        let id = request_id.0.clone();
        let name = key.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let seq: i64 = conn
                .query_row(
                    "INSERT INTO lists (request_id, name, seq, value)
                     SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, ?3
                     FROM lists WHERE request_id = ?1 AND name = ?2
                     RETURNING seq",
                    params![id, name, value.to_string()],
                    |row| row.get(0),
                )
                .map_err(store_err)?;
            Ok(seq)
        })
    }

    fn list(
        &self,
        request_id: &RequestId,
        key: &str,
    ) -> BoxFuture<'_, Result<Vec<serde_json::Value>>> {
        let id = request_id.0.clone();
        let name = key.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT value FROM lists WHERE request_id = ?1 AND name = ?2 ORDER BY seq",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![id, name], |row| row.get::<_, String>(0))
                .map_err(store_err)?;

            let mut values = Vec::new();
            for row in rows {
                let text = row.map_err(store_err)?;
                values.push(serde_json::from_str(&text)?);
            }
            Ok(values)
        })
    }

    fn put_transit(&self, request_id: &RequestId, transit: &Transit) -> BoxFuture<'_, Result<()>> {
        let id = request_id.0.clone();
        let transit = transit.clone();
        Box::pin(async move {
            let record = serde_json::to_string(&transit)?;
            let conn = self.lock();
            conn.execute(
                "INSERT INTO transits (request_id, from_id, to_id, message_id, record)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(request_id, from_id, to_id, message_id)
                 DO UPDATE SET record = excluded.record",
                params![
                    id,
                    transit.from,
                    transit.to,
                    transit.message_id.clone().unwrap_or_default(),
                    record
                ],
            )
            .map_err(store_err)?;
            Ok(())
        })
    }

    fn transits(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Vec<Transit>>> {
        let id = request_id.0.clone();
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn
                .prepare("SELECT record FROM transits WHERE request_id = ?1 ORDER BY rowid")
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))
                .map_err(store_err)?;
            collect_transits(rows)
        })
    }

    fn transits_to(
        &self,
        request_id: &RequestId,
        to_prefix: &str,
    ) -> BoxFuture<'_, Result<Vec<Transit>>> {
        let id = request_id.0.clone();
        let prefix = to_prefix.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT record FROM transits
                     WHERE request_id = ?1 AND substr(to_id, 1, length(?2)) = ?2
                     ORDER BY rowid",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![id, prefix], |row| row.get::<_, String>(0))
                .map_err(store_err)?;
            collect_transits(rows)
        })
    }

    fn remove(&self, request_id: &RequestId) -> BoxFuture<'_, Result<()>> {
        let id = request_id.0.clone();
        Box::pin(async move {
            let conn = self.lock();
            for table in ["activations", "counters", "lists", "transits"] {
                conn.execute(
                    &format!("DELETE FROM {} WHERE request_id = ?1", table),
                    params![id],
                )
                .map_err(store_err)?;
            }
            Ok(())
        })
    }
}

fn collect_transits(rows: impl Iterator<Item = rusqlite::Result<String>>) -> Result<Vec<Transit>> {
    let mut transits = Vec::new();
    for row in rows {
        let record = row.map_err(store_err)?;
        transits.push(serde_json::from_str(&record)?);
    }
    Ok(transits)
}
