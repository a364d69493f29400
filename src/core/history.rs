//! Append-only history log with pluggable persistence.
//!
//! The [`HistoryStore`] trait is the only thing the engine needs from a
//! storage backend: append a batch of events for an instance and read them
//! back in order. Three backends are provided:
//! - [`JsonlHistoryStore`]: one newline-delimited JSON file per instance
//! - [`SqliteHistoryStore`]: a single SQLite table keyed by (instance, sequence)
//! - [`InMemoryHistoryStore`]: process-local, for tests and ephemeral hosts
//!
//! Every backend enforces sequence continuity on append, so two writers
//! racing on the same instance cannot both succeed.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::domain::HistoryEvent;

/// Durable, ordered, per-instance event log
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Append events to an instance history.
    ///
    /// The first event must carry `last_sequence + 1` and the batch must be
    /// contiguous; otherwise the append fails with [`HistoryError::SequenceConflict`].
    async fn append(&self, instance_id: &str, events: &[HistoryEvent]) -> Result<()>;

    /// Read the full history of an instance, ordered by sequence
    async fn read(&self, instance_id: &str) -> Result<Vec<HistoryEvent>>;

    /// List all known instance ids
    async fn list_instances(&self) -> Result<Vec<String>>;

    /// Whether any history exists for the instance
    async fn exists(&self, instance_id: &str) -> Result<bool> {
        Ok(!self.read(instance_id).await?.is_empty())
    }
}

/// Errors raised by history backends
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("Sequence conflict for instance {instance_id}: expected {expected}, got {actual}")]
    SequenceConflict {
        instance_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Event for instance {actual} appended to history of {expected}")]
    InstanceMismatch { expected: String, actual: String },

    #[error("Invalid instance id: {0:?}")]
    InvalidInstanceId(String),
}

/// Verify that `events` continue a history whose last sequence is `last_sequence`
pub fn check_continuity(
    instance_id: &str,
    last_sequence: u64,
    events: &[HistoryEvent],
) -> Result<(), HistoryError> {
    let mut expected = last_sequence + 1;
    for event in events {
        if event.instance_id != instance_id {
            return Err(HistoryError::InstanceMismatch {
                expected: instance_id.to_string(),
                actual: event.instance_id.clone(),
            });
        }
        if event.sequence != expected {
            return Err(HistoryError::SequenceConflict {
                instance_id: instance_id.to_string(),
                expected,
                actual: event.sequence,
            });
        }
        expected += 1;
    }
    Ok(())
}

/// Instance ids become file names, so only a conservative character set is accepted
pub fn validate_instance_id(instance_id: &str) -> Result<(), HistoryError> {
    let valid = !instance_id.is_empty()
        && instance_id.len() <= 128
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !instance_id.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(HistoryError::InvalidInstanceId(instance_id.to_string()))
    }
}

// ============================================================================
// JSONL
// ============================================================================

/// File-based history store using JSONL format, one file per instance
#[derive(Debug, Clone)]
pub struct JsonlHistoryStore {
    /// Directory containing `<instance_id>.jsonl` files
    root: PathBuf,
}

impl JsonlHistoryStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create history directory: {}", root.display()))?;
        Ok(Self { root })
    }

    /// Get the history directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path of an instance's history file
    pub fn history_path(&self, instance_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", instance_id))
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<HistoryEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .with_context(|| format!("Failed to open history file: {}", path.display()))?;

    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read history file: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: HistoryEvent = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse history event: {}", line))?;
        events.push(event);
    }

    Ok(events)
}

fn append_jsonl(path: &Path, instance_id: &str, events: &[HistoryEvent]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open history file: {}", path.display()))?;

    // Held until the file is dropped
    file.lock_exclusive()
        .with_context(|| format!("Failed to acquire lock on {}", path.display()))?;

    let last_sequence = read_jsonl(path)?.last().map(|e| e.sequence).unwrap_or(0);
    check_continuity(instance_id, last_sequence, events)?;

    let mut buffer = String::new();
    for event in events {
        buffer.push_str(&serde_json::to_string(event).context("Failed to serialize event")?);
        buffer.push('\n');
    }

    file.write_all(buffer.as_bytes())
        .context("Failed to write history events")?;
    file.flush().context("Failed to flush history events")?;

    Ok(())
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, instance_id: &str, events: &[HistoryEvent]) -> Result<()> {
        validate_instance_id(instance_id)?;
        if events.is_empty() {
            return Ok(());
        }

        let path = self.history_path(instance_id);
        let instance_id = instance_id.to_string();
        let events = events.to_vec();

        tokio::task::spawn_blocking(move || append_jsonl(&path, &instance_id, &events))
            .await
            .context("History append task panicked")?
    }

    async fn read(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        validate_instance_id(instance_id)?;
        let path = self.history_path(instance_id);

        tokio::task::spawn_blocking(move || read_jsonl(&path))
            .await
            .context("History read task panicked")?
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        let mut instances = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list history directory: {}", self.root.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                instances.push(stem.to_string());
            }
        }

        instances.sort();
        Ok(instances)
    }

    async fn exists(&self, instance_id: &str) -> Result<bool> {
        validate_instance_id(instance_id)?;
        Ok(self.history_path(instance_id).exists())
    }
}

// ============================================================================
// SQLite
// ============================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS history (
    instance_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    event TEXT NOT NULL,
    PRIMARY KEY (instance_id, sequence)
);
";

/// SQLite-backed history store
#[derive(Clone)]
pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    /// Open (and migrate) a database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open history database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create history schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("History database lock poisoned"))?;
            f(&mut *guard)
        })
        .await
        .context("History database task panicked")?
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, instance_id: &str, events: &[HistoryEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let instance_id = instance_id.to_string();
        let events = events.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let last_sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM history WHERE instance_id = ?1",
                params![instance_id],
                |row| row.get(0),
            )?;
            check_continuity(&instance_id, last_sequence as u64, &events)?;

            for event in &events {
                let json = serde_json::to_string(event).context("Failed to serialize event")?;
                tx.execute(
                    "INSERT INTO history (instance_id, sequence, event) VALUES (?1, ?2, ?3)",
                    params![instance_id, event.sequence as i64, json],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn read(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        let instance_id = instance_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event FROM history WHERE instance_id = ?1 ORDER BY sequence ASC",
            )?;
            let rows = stmt.query_map(params![instance_id], |row| row.get::<_, String>(0))?;

            let mut events = Vec::new();
            for row in rows {
                let json = row?;
                let event: HistoryEvent = serde_json::from_str(&json)
                    .with_context(|| format!("Failed to parse history event: {}", json))?;
                events.push(event);
            }
            Ok(events)
        })
        .await
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT DISTINCT instance_id FROM history ORDER BY instance_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let ids = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local history store
#[derive(Debug, Default, Clone)]
pub struct InMemoryHistoryStore {
    histories: Arc<Mutex<BTreeMap<String, Vec<HistoryEvent>>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<HistoryEvent>>>> {
        self.histories
            .lock()
            .map_err(|_| anyhow::anyhow!("History lock poisoned"))
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, instance_id: &str, events: &[HistoryEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut histories = self.lock()?;
        let history = histories.entry(instance_id.to_string()).or_default();
        let last_sequence = history.last().map(|e| e.sequence).unwrap_or(0);
        check_continuity(instance_id, last_sequence, events)?;
        history.extend_from_slice(events);
        Ok(())
    }

    async fn read(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        Ok(self.lock()?.get(instance_id).cloned().unwrap_or_default())
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn history(instance_id: &str) -> Vec<HistoryEvent> {
        vec![
            HistoryEvent::orchestrator_started(instance_id, "Demo", json!({"x": 1})),
            HistoryEvent::task_scheduled(instance_id, 2, 0, "A", json!(1)),
        ]
    }

    #[test]
    fn test_check_continuity() {
        let events = history("i1");
        assert!(check_continuity("i1", 0, &events).is_ok());
        assert_eq!(
            check_continuity("i1", 1, &events),
            Err(HistoryError::SequenceConflict {
                instance_id: "i1".to_string(),
                expected: 2,
                actual: 1,
            })
        );
        assert!(matches!(
            check_continuity("other", 0, &events),
            Err(HistoryError::InstanceMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_instance_id() {
        assert!(validate_instance_id("order-42_v1.0").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("../etc/passwd").is_err());
        assert!(validate_instance_id(".hidden").is_err());
        assert!(validate_instance_id("a/b").is_err());
    }

    #[tokio::test]
    async fn test_jsonl_append_and_read() {
        let temp = TempDir::new().unwrap();
        let store = JsonlHistoryStore::open(temp.path()).unwrap();

        store.append("i1", &history("i1")).await.unwrap();
        let events = store.read("i1").await.unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].name.as_deref(), Some("A"));
        assert!(store.exists("i1").await.unwrap());
        assert!(!store.exists("i2").await.unwrap());
    }

    #[tokio::test]
    async fn test_jsonl_rejects_stale_append() {
        let temp = TempDir::new().unwrap();
        let store = JsonlHistoryStore::open(temp.path()).unwrap();

        store.append("i1", &history("i1")).await.unwrap();
        let err = store.append("i1", &history("i1")).await.unwrap_err();

        assert!(err.downcast_ref::<HistoryError>().is_some());
        assert_eq!(store.read("i1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_append_and_read() {
        let store = SqliteHistoryStore::open_in_memory().unwrap();

        store.append("i1", &history("i1")).await.unwrap();
        store.append("i2", &history("i2")[..1]).await.unwrap();

        let events = store.read("i1").await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(events[0].payload, json!({"x": 1}));
        assert_eq!(store.list_instances().await.unwrap(), vec!["i1", "i2"]);
    }

    #[tokio::test]
    async fn test_memory_rejects_gap() {
        let store = InMemoryHistoryStore::new();
        let events = history("i1");

        let err = store.append("i1", &events[1..]).await.unwrap_err();
        assert!(err.to_string().contains("expected 1"));
        assert!(store.read("i1").await.unwrap().is_empty());
    }
}
