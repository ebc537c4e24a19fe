//! Durable checkpoint persistence for graph state.
//!
//! A checkpoint is an immutable snapshot of graph state plus channel
//! versions, keyed by `(thread, namespace, id)`. Channel values are stored
//! separately from the checkpoint body: checkpoints that share a channel
//! version share the blob, and `get_tuple` reconstructs `channel_values` by
//! joining `channel_versions` against the blob table.
//!
//! All access to the database funnels through one mutex-guarded connection
//! per checkpointer instance, so writes are serialized.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Identifies a thread (and optionally an exact checkpoint) for load/store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    pub thread_id: String,
    #[serde(default)]
    pub checkpoint_ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl ThreadConfig {
    /// Config addressing the latest checkpoint of a thread.
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    pub fn at(&self, checkpoint_id: impl Into<String>) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint_id.into()),
        }
    }
}

/// Snapshot of graph state at one node boundary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Checkpoint {
    pub id: String,
    /// ISO-8601 creation time.
    pub ts: String,
    /// Values per channel. Not serialized with the checkpoint body; the
    /// store reconstructs this map from blobs on read.
    #[serde(default)]
    pub channel_values: Map<String, Value>,
    /// Version per channel, sortable strings.
    #[serde(default)]
    pub channel_versions: BTreeMap<String, String>,
}

/// Metadata stored next to every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointMetadata {
    /// Where the checkpoint came from: `input`, `loop`, `update`.
    #[serde(default)]
    pub source: String,
    /// Monotonic step counter within the run.
    #[serde(default)]
    pub step: i64,
    /// The node that just completed.
    #[serde(default)]
    pub node: String,
    /// The node the engine will execute next; `None` at END.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An in-flight write recorded for a task before its checkpoint landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: Value,
}

/// A loaded checkpoint with its config, metadata, parent and pending writes.
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub config: ThreadConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent_config: Option<ThreadConfig>,
    pub pending_writes: Vec<PendingWrite>,
}

/// Checkpoint body as persisted (without channel values).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointRecord {
    id: String,
    ts: String,
    channel_versions: BTreeMap<String, String>,
}

const VALUE_TYPE_JSON: &str = "json";
const VALUE_TYPE_EMPTY: &str = "empty";

/// SQLite-backed checkpointer (single-file database).
pub struct SqliteCheckpointer {
    db_path: PathBuf,
    conn: Mutex<Connection>,
    /// Per-instance counter folded into checkpoint ids so ids created in
    /// the same microsecond still sort in creation order.
    seq: AtomicU64,
}

impl SqliteCheckpointer {
    /// Open (creating if needed) the checkpoint database at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(EngineError::storage)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
            seq: AtomicU64::new(0),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
              thread_id TEXT NOT NULL,
              checkpoint_ns TEXT NOT NULL,
              checkpoint_id TEXT NOT NULL,
              checkpoint_type TEXT NOT NULL,
              checkpoint_blob BLOB NOT NULL,
              metadata_type TEXT NOT NULL,
              metadata_blob BLOB NOT NULL,
              parent_checkpoint_id TEXT,
              created_at TEXT DEFAULT (datetime('now')),
              PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id)
            );

            CREATE TABLE IF NOT EXISTS blobs (
              thread_id TEXT NOT NULL,
              checkpoint_ns TEXT NOT NULL,
              channel TEXT NOT NULL,
              version TEXT NOT NULL,
              value_type TEXT NOT NULL,
              value_blob BLOB NOT NULL,
              PRIMARY KEY (thread_id, checkpoint_ns, channel, version)
            );

            CREATE TABLE IF NOT EXISTS writes (
              thread_id TEXT NOT NULL,
              checkpoint_ns TEXT NOT NULL,
              checkpoint_id TEXT NOT NULL,
              task_id TEXT NOT NULL,
              write_idx INTEGER NOT NULL,
              channel TEXT NOT NULL,
              value_type TEXT NOT NULL,
              value_blob BLOB NOT NULL,
              task_path TEXT NOT NULL,
              PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id, task_id, write_idx)
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_latest
            ON checkpoints(thread_id, checkpoint_ns, checkpoint_id);
            "#,
        )?;
        Ok(())
    }

    /// Generate a fresh checkpoint id. Lexicographic order on the string
    /// form equals temporal order: a fixed-width UTC microsecond stamp, the
    /// per-instance counter, then a random suffix.
    pub fn new_checkpoint_id(&self) -> String {
        let now = Utc::now();
        let micros = now.timestamp_micros().max(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::random();
        format!("{micros:020}-{seq:08}-{suffix:08x}")
    }

    /// Produce the next monotonically increasing channel version. Encoded as
    /// `<int:032>.<random:016>` so string order equals numeric order.
    pub fn next_version(&self, current: Option<&str>) -> String {
        let current_v = current
            .and_then(|s| s.split('.').next())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let suffix: u64 = rand::random();
        format!("{:032}.{suffix:016x}", current_v + 1)
    }

    /// Persist a checkpoint and return the config that identifies it.
    ///
    /// Only channels named in `new_versions` get fresh blobs; unchanged
    /// channels keep pointing at blobs shared with earlier checkpoints.
    pub fn put(
        &self,
        config: &ThreadConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
        new_versions: &BTreeMap<String, String>,
    ) -> Result<ThreadConfig> {
        let conn = self.lock_conn()?;
        let parent_id = config.checkpoint_id.clone();

        for (channel, version) in new_versions {
            let (value_type, blob) = match checkpoint.channel_values.get(channel) {
                Some(value) => (VALUE_TYPE_JSON, serde_json::to_vec(value)?),
                None => (VALUE_TYPE_EMPTY, Vec::new()),
            };
            conn.execute(
                "INSERT OR REPLACE INTO blobs(
                   thread_id, checkpoint_ns, channel, version, value_type, value_blob
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    config.thread_id,
                    config.checkpoint_ns,
                    channel,
                    version,
                    value_type,
                    blob
                ],
            )?;
        }

        let record = CheckpointRecord {
            id: checkpoint.id.clone(),
            ts: checkpoint.ts.clone(),
            channel_versions: checkpoint.channel_versions.clone(),
        };
        let checkpoint_blob = serde_json::to_vec(&record)?;
        let metadata_blob = serde_json::to_vec(metadata)?;

        conn.execute(
            "INSERT OR REPLACE INTO checkpoints(
               thread_id, checkpoint_ns, checkpoint_id,
               checkpoint_type, checkpoint_blob,
               metadata_type, metadata_blob,
               parent_checkpoint_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                config.thread_id,
                config.checkpoint_ns,
                checkpoint.id,
                VALUE_TYPE_JSON,
                checkpoint_blob,
                VALUE_TYPE_JSON,
                metadata_blob,
                parent_id
            ],
        )?;

        Ok(ThreadConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        })
    }

    /// Load a checkpoint tuple: the one named by `config.checkpoint_id`, or
    /// the latest for the thread when no explicit id is given.
    pub fn get_tuple(&self, config: &ThreadConfig) -> Result<Option<CheckpointTuple>> {
        let conn = self.lock_conn()?;

        let checkpoint_id = match &config.checkpoint_id {
            Some(id) => id.clone(),
            None => {
                match Self::latest_checkpoint_id(&conn, &config.thread_id, &config.checkpoint_ns)? {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
        };

        Self::load_tuple(&conn, &config.thread_id, &config.checkpoint_ns, &checkpoint_id)
    }

    fn latest_checkpoint_id(
        conn: &Connection,
        thread_id: &str,
        checkpoint_ns: &str,
    ) -> Result<Option<String>> {
        let id = conn
            .query_row(
                "SELECT checkpoint_id FROM checkpoints
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2
                 ORDER BY checkpoint_id DESC LIMIT 1",
                params![thread_id, checkpoint_ns],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id)
    }

    fn load_tuple(
        conn: &Connection,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointTuple>> {
        let row = conn
            .query_row(
                "SELECT checkpoint_blob, metadata_blob, parent_checkpoint_id
                 FROM checkpoints
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                params![thread_id, checkpoint_ns, checkpoint_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let (checkpoint_blob, metadata_blob, parent_id) = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let record: CheckpointRecord = serde_json::from_slice(&checkpoint_blob)
            .map_err(|e| EngineError::Corruption(format!("unreadable checkpoint body: {e}")))?;
        let metadata: CheckpointMetadata = serde_json::from_slice(&metadata_blob)
            .map_err(|e| EngineError::Corruption(format!("unreadable checkpoint metadata: {e}")))?;

        let channel_values = Self::load_blobs(conn, thread_id, checkpoint_ns, &record.channel_versions)?;
        let pending_writes = Self::load_writes(conn, thread_id, checkpoint_ns, checkpoint_id)?;

        let config = ThreadConfig {
            thread_id: thread_id.to_string(),
            checkpoint_ns: checkpoint_ns.to_string(),
            checkpoint_id: Some(checkpoint_id.to_string()),
        };

        Ok(Some(CheckpointTuple {
            config: config.clone(),
            checkpoint: Checkpoint {
                id: record.id,
                ts: record.ts,
                channel_values,
                channel_versions: record.channel_versions,
            },
            metadata,
            parent_config: parent_id.map(|id| ThreadConfig {
                thread_id: thread_id.to_string(),
                checkpoint_ns: checkpoint_ns.to_string(),
                checkpoint_id: Some(id),
            }),
            pending_writes,
        }))
    }

    fn load_blobs(
        conn: &Connection,
        thread_id: &str,
        checkpoint_ns: &str,
        versions: &BTreeMap<String, String>,
    ) -> Result<Map<String, Value>> {
        let mut channel_values = Map::new();
        let mut stmt = conn.prepare(
            "SELECT value_type, value_blob FROM blobs
             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND channel = ?3 AND version = ?4",
        )?;
        for (channel, version) in versions {
            let row = stmt
                .query_row(params![thread_id, checkpoint_ns, channel, version], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .optional()?;
            if let Some((value_type, blob)) = row {
                if value_type != VALUE_TYPE_EMPTY {
                    let value: Value = serde_json::from_slice(&blob).map_err(|e| {
                        EngineError::Corruption(format!(
                            "unreadable blob for channel {channel}: {e}"
                        ))
                    })?;
                    channel_values.insert(channel.clone(), value);
                }
            }
        }
        Ok(channel_values)
    }

    fn load_writes(
        conn: &Connection,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<PendingWrite>> {
        let mut stmt = conn.prepare(
            "SELECT task_id, channel, value_type, value_blob FROM writes
             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
             ORDER BY task_id, write_idx",
        )?;
        let rows = stmt.query_map(params![thread_id, checkpoint_ns, checkpoint_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut pending = Vec::new();
        for row in rows {
            let (task_id, channel, value_type, blob) = row?;
            let value = if value_type == VALUE_TYPE_EMPTY {
                Value::Null
            } else {
                serde_json::from_slice(&blob).map_err(|e| {
                    EngineError::Corruption(format!("unreadable pending write: {e}"))
                })?
            };
            pending.push(PendingWrite {
                task_id,
                channel,
                value,
            });
        }
        Ok(pending)
    }

    /// Record in-flight writes for a task against the checkpoint named by
    /// `config`. Duplicate `(task, idx)` records are ignored, which is what
    /// makes replay after a crash idempotent.
    pub fn put_writes(
        &self,
        config: &ThreadConfig,
        writes: &[(String, Value)],
        task_id: &str,
        task_path: &str,
    ) -> Result<()> {
        let checkpoint_id = config.checkpoint_id.as_deref().ok_or_else(|| {
            EngineError::Storage("put_writes requires an explicit checkpoint_id".to_string())
        })?;
        let conn = self.lock_conn()?;
        for (idx, (channel, value)) in writes.iter().enumerate() {
            let blob = serde_json::to_vec(value)?;
            conn.execute(
                "INSERT OR IGNORE INTO writes(
                   thread_id, checkpoint_ns, checkpoint_id,
                   task_id, write_idx, channel,
                   value_type, value_blob, task_path
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    config.thread_id,
                    config.checkpoint_ns,
                    checkpoint_id,
                    task_id,
                    idx as i64,
                    channel,
                    VALUE_TYPE_JSON,
                    blob,
                    task_path
                ],
            )?;
        }
        Ok(())
    }

    /// Iterate checkpoints for a thread in descending id order, optionally
    /// filtered on metadata equality, bounded by `before` and `limit`.
    pub fn list(
        &self,
        config: &ThreadConfig,
        filter: Option<&Map<String, Value>>,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let ids: Vec<String> = {
            let conn = self.lock_conn()?;
            let mut sql = String::from(
                "SELECT checkpoint_id FROM checkpoints
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2",
            );
            if before.is_some() {
                sql.push_str(" AND checkpoint_id < ?3");
            }
            sql.push_str(" ORDER BY checkpoint_id DESC");

            let mut stmt = conn.prepare(&sql)?;
            let map_row = |row: &rusqlite::Row<'_>| row.get::<_, String>(0);
            let rows = match before {
                Some(b) => stmt.query_map(
                    params![config.thread_id, config.checkpoint_ns, b],
                    map_row,
                )?,
                None => stmt.query_map(params![config.thread_id, config.checkpoint_ns], map_row)?,
            };
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut tuples = Vec::new();
        for id in ids {
            if let Some(limit) = limit {
                if tuples.len() >= limit {
                    break;
                }
            }
            let tuple = match self.get_tuple(&config.at(&id))? {
                Some(t) => t,
                None => continue,
            };
            if let Some(filter) = filter {
                let meta = serde_json::to_value(&tuple.metadata)?;
                let matches = filter.iter().all(|(k, v)| meta.get(k) == Some(v));
                if !matches {
                    continue;
                }
            }
            tuples.push(tuple);
        }
        Ok(tuples)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Storage("checkpointer connection poisoned".to_string()))
    }
}
