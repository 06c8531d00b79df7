use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::aggregate::AggregateSnapshot;
use crate::error::DashboardError;
use crate::Threshold;

/// Default key the aggregate snapshot is stored under.
pub const DEFAULT_STATE_KEY: &str = "dashState";

/// Flat key-value persistence capability.
pub trait KeyValueStore: Send {
    fn get(&mut self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    fn remove(&mut self, key: &str) -> Result<()>;
}

// ----------------------------------------------------------------------------
// SQLite store
// ----------------------------------------------------------------------------

pub struct SqliteKeyValueStore {
    conn: Connection,
}

impl SqliteKeyValueStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS kv_store (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let updated_at = chrono::Utc::now().timestamp();
        self.conn.execute(
            r#"
            INSERT INTO kv_store(key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, updated_at],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory store
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct InMemoryEntries {
    values: HashMap<String, String>,
    writes: usize,
}

/// In-memory store. Clones share the same entries, so a test can keep a clone
/// to inspect what the aggregator wrote.
#[derive(Clone, Debug, Default)]
pub struct InMemoryKeyValueStore {
    inner: Arc<Mutex<InMemoryEntries>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw value (e.g. a corrupted payload).
    pub fn with_value(self, key: &str, value: &str) -> Self {
        if let Ok(mut entries) = self.inner.lock() {
            entries.values.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Number of successful `set` calls.
    pub fn writes(&self) -> usize {
        self.inner.lock().map(|entries| entries.writes).unwrap_or(0)
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|entries| entries.values.get(key).cloned())
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        let entries = self
            .inner
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        Ok(entries.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .inner
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        entries.values.insert(key.to_string(), value.to_string());
        entries.writes += 1;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let mut entries = self
            .inner
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        entries.values.remove(key);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Snapshot persistence
// ----------------------------------------------------------------------------

/// Durable snapshot of `{counts, total, threshold}` under one key.
///
/// Loading never fails: a missing key, unreadable store, or malformed
/// payload all yield the default snapshot. Individual fields that are absent
/// or of the wrong type fall back to their defaults on their own.
pub struct PersistenceStore {
    store: Box<dyn KeyValueStore>,
    key: String,
}

impl PersistenceStore {
    pub fn new(store: Box<dyn KeyValueStore>, key: &str) -> Self {
        Self {
            store,
            key: key.to_string(),
        }
    }

    pub fn in_memory(store: InMemoryKeyValueStore) -> Self {
        Self::new(Box::new(store), DEFAULT_STATE_KEY)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn load(&mut self, default_threshold: Threshold) -> AggregateSnapshot {
        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return AggregateSnapshot::empty(default_threshold),
            Err(err) => {
                log::warn!("persisted state unavailable, starting empty: {:#}", err);
                return AggregateSnapshot::empty(default_threshold);
            }
        };
        match parse_snapshot(&raw, default_threshold) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::warn!("{}; starting empty", err);
                AggregateSnapshot::empty(default_threshold)
            }
        }
    }

    pub fn save(&mut self, snapshot: &AggregateSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.store.set(&self.key, &json)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.store.remove(&self.key)
    }
}

fn parse_snapshot(
    raw: &str,
    default_threshold: Threshold,
) -> std::result::Result<AggregateSnapshot, DashboardError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| DashboardError::PersistenceCorruption(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(DashboardError::PersistenceCorruption(
            "snapshot is not a JSON object".to_string(),
        ));
    };

    let counts = fields
        .get("counts")
        .and_then(Value::as_object)
        .map(parse_counts)
        .unwrap_or_default();
    let total = fields.get("total").and_then(Value::as_u64).unwrap_or(0);
    let threshold = fields
        .get("threshold")
        .and_then(Value::as_f64)
        .map(|t| Threshold::clamped(t as f32))
        .unwrap_or(default_threshold);

    Ok(AggregateSnapshot {
        counts,
        total,
        threshold: threshold.value(),
    })
}

fn parse_counts(map: &Map<String, Value>) -> BTreeMap<String, u64> {
    map.iter()
        .filter_map(|(class, count)| count.as_u64().map(|n| (class.clone(), n)))
        .collect()
}
