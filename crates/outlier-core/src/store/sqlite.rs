//! SQLite-backed Log Store and Feature Store.
//!
//! One connection behind a mutex; every call runs on the blocking pool.
//! Timestamps are stored as fixed-width RFC 3339 UTC text with nanosecond
//! digits, so lexical order is time order and values round-trip exactly.

use super::{FeatureStore, LogStore};
use crate::error::StorageError;
use crate::event::{Event, FeatureVector};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Params, Statement, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        timestamp TEXT NOT NULL,
        entity_key TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        status_code INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_logs_entity_timestamp ON logs(entity_key, timestamp);
    CREATE TABLE IF NOT EXISTS features (
        entity_key TEXT NOT NULL,
        window_end TEXT NOT NULL,
        request_count INTEGER NOT NULL,
        client_error_count INTEGER NOT NULL,
        server_error_count INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_features_entity_window ON features(entity_key, window_end);
";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Stored feature rows for one entity, in window order.
    pub async fn features_for(&self, entity_key: &str) -> Result<Vec<FeatureVector>, StorageError> {
        let entity_key = entity_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_key, window_end, request_count, client_error_count, server_error_count
                 FROM features WHERE entity_key = ?1 ORDER BY window_end, rowid",
            )?;
            let rows = stmt.query_map(params![entity_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (entity_key, window_end, requests, client, server) = row?;
                out.push(FeatureVector {
                    entity_key,
                    window_end: parse_timestamp("features", &window_end)?,
                    request_count: count_from_sql(requests)?,
                    client_error_count: count_from_sql(client)?,
                    server_error_count: count_from_sql(server)?,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn append(&self, event: &Event) -> Result<(), StorageError> {
        let event = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO logs (timestamp, entity_key, endpoint, status_code)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    format_timestamp(event.timestamp),
                    event.entity_key,
                    event.endpoint,
                    event.status_code,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn query(
        &self,
        entity_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError> {
        let entity_key = entity_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, entity_key, endpoint, status_code FROM logs
                 WHERE entity_key = ?1 AND timestamp >= ?2 AND timestamp < ?3
                 ORDER BY timestamp",
            )?;
            read_events(
                &mut stmt,
                params![entity_key, format_timestamp(start), format_timestamp(end)],
            )
        })
        .await
    }

    async fn query_since(
        &self,
        entity_key: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError> {
        let entity_key = entity_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, entity_key, endpoint, status_code FROM logs
                 WHERE entity_key = ?1 AND timestamp >= ?2
                 ORDER BY timestamp",
            )?;
            read_events(&mut stmt, params![entity_key, format_timestamp(start)])
        })
        .await
    }

    async fn all_events(&self) -> Result<Vec<Event>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, entity_key, endpoint, status_code FROM logs
                 ORDER BY entity_key, timestamp",
            )?;
            read_events(&mut stmt, [])
        })
        .await
    }
}

#[async_trait]
impl FeatureStore for SqliteStore {
    async fn replace_all(
        &self,
        features: BTreeMap<String, Vec<FeatureVector>>,
    ) -> Result<(), StorageError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM features", [])?;
            let mut written = 0usize;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO features
                     (entity_key, window_end, request_count, client_error_count, server_error_count)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (entity_key, vectors) in &features {
                    for v in vectors {
                        insert.execute(params![
                            entity_key,
                            format_timestamp(v.window_end),
                            count_to_sql(v.request_count)?,
                            count_to_sql(v.client_error_count)?,
                            count_to_sql(v.server_error_count)?,
                        ])?;
                        written += 1;
                    }
                }
            }
            tx.commit()?;
            debug!(removed, written, "Feature table replaced");
            Ok(())
        })
        .await
    }
}

fn read_events<P: Params>(stmt: &mut Statement<'_>, params: P) -> Result<Vec<Event>, StorageError> {
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, u16>(3)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (timestamp, entity_key, endpoint, status_code) = row?;
        events.push(Event {
            timestamp: parse_timestamp("logs", &timestamp)?,
            entity_key,
            endpoint,
            status_code,
        });
    }
    Ok(events)
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptRow {
            table,
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn count_to_sql(count: u64) -> Result<i64, StorageError> {
    i64::try_from(count).map_err(|_| StorageError::CorruptRow {
        table: "features",
        reason: format!("count {count} does not fit in INTEGER"),
    })
}

fn count_from_sql(count: i64) -> Result<u64, StorageError> {
    u64::try_from(count).map_err(|_| StorageError::CorruptRow {
        table: "features",
        reason: format!("negative count {count}"),
    })
}
