//! Durable session checkpoints.
//!
//! A checkpoint is a snapshot of one session's message history plus a
//! free-text summary and a metadata map. Each session keeps at most
//! `max_checkpoints_per_session` snapshots; saving past that limit evicts
//! the oldest ones in the same transaction as the insert.
//!
//! Messages are stored as JSON values so this crate stays independent of
//! the agent's message type. [`Checkpoint::messages_as`] converts them back.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Checkpoint policy, usually read from the `[checkpoint]` config table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Whether the orchestrator saves checkpoints automatically.
    pub enabled: bool,
    /// Directory holding the SQLite file.
    pub data_dir: PathBuf,
    /// Auto-save every N completed turns.
    pub auto_save_interval: u32,
    /// Retention bound per session; older snapshots are evicted first.
    pub max_checkpoints_per_session: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from(".moco/checkpoints"),
            auto_save_interval: 5,
            max_checkpoints_per_session: 10,
        }
    }
}

impl CheckpointConfig {
    /// Reject settings that would make auto-save or retention meaningless.
    pub fn validate(&self) -> StoreResult<()> {
        if self.auto_save_interval == 0 {
            return Err(StoreError::InvalidArgument(
                "auto_save_interval must be at least 1".into(),
            ));
        }
        if self.max_checkpoints_per_session == 0 {
            return Err(StoreError::InvalidArgument(
                "max_checkpoints_per_session must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A persisted snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `cp_{YYYYmmdd_HHMMSS}_{hex8}`.
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub summary: String,
    pub metadata: Map<String, Value>,
    pub messages: Vec<Value>,
}

impl Checkpoint {
    /// Decode the stored messages into the caller's message type.
    pub fn messages_as<M: DeserializeOwned>(&self) -> StoreResult<Vec<M>> {
        self.messages
            .iter()
            .cloned()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    /// The `turn_count` metadata entry, when present.
    pub fn turn_count(&self) -> Option<u64> {
        self.metadata.get("turn_count").and_then(Value::as_u64)
    }
}

/// Returns `true` on every `interval`-th turn, never on turn 0.
pub fn should_auto_save(turn_count: u64, interval: u32) -> bool {
    interval > 0 && turn_count > 0 && turn_count % u64::from(interval) == 0
}

// ═══════════════════════════════════════════════════════════════════════
//  CheckpointStore
// ═══════════════════════════════════════════════════════════════════════

/// SQLite-backed checkpoint persistence with per-session FIFO retention.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    db: Database,
    max_per_session: usize,
}

impl CheckpointStore {
    /// Wrap an already-migrated database.
    pub fn new(db: Database, max_per_session: usize) -> Self {
        Self {
            db,
            max_per_session: max_per_session.max(1),
        }
    }

    /// Validate `config`, then open the database under `config.data_dir`.
    pub async fn open(config: &CheckpointConfig) -> StoreResult<Self> {
        config.validate()?;
        let db = Database::open_in_dir(&config.data_dir).await?;
        Ok(Self::new(db, config.max_checkpoints_per_session))
    }

    /// Retention bound applied on every save.
    pub fn max_per_session(&self) -> usize {
        self.max_per_session
    }

    /// Persist a snapshot and evict the oldest ones beyond the retention bound.
    ///
    /// The insert and the eviction run in one transaction.
    #[instrument(skip(self, history, summary, metadata), fields(messages = history.len()))]
    pub async fn save<M: Serialize>(
        &self,
        session_id: &str,
        history: &[M],
        summary: &str,
        metadata: Map<String, Value>,
    ) -> StoreResult<Checkpoint> {
        validate_id("session", session_id)?;

        let messages = history
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        let created_at = Utc::now();
        let checkpoint = Checkpoint {
            id: generate_checkpoint_id(created_at),
            session_id: session_id.to_owned(),
            created_at,
            summary: summary.to_owned(),
            metadata,
            messages,
        };

        let row = checkpoint.clone();
        let messages_json = serde_json::to_string(&row.messages)?;
        let metadata_json = serde_json::to_string(&row.metadata)?;
        let keep = self.max_per_session as i64;

        let evicted = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO checkpoints (id, session_id, summary, metadata, messages, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        row.id,
                        row.session_id,
                        row.summary,
                        metadata_json,
                        messages_json,
                        row.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    ],
                )?;
                let evicted = tx.execute(
                    "DELETE FROM checkpoints WHERE session_id = ?1 AND seq NOT IN \
                     (SELECT seq FROM checkpoints WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2)",
                    rusqlite::params![row.session_id, keep],
                )?;
                tx.commit()?;
                Ok(evicted)
            })
            .await?;

        if evicted > 0 {
            debug!(session_id, evicted, "evicted old checkpoints");
        }
        info!(session_id, checkpoint_id = %checkpoint.id, "checkpoint saved");
        Ok(checkpoint)
    }

    /// Load a checkpoint by id.
    #[instrument(skip(self))]
    pub async fn load(&self, checkpoint_id: &str) -> StoreResult<Checkpoint> {
        validate_id("checkpoint", checkpoint_id)?;
        let id = checkpoint_id.to_owned();
        let raw = self
            .db
            .execute(move |conn| {
                conn.query_row(
                    &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                    rusqlite::params![id],
                    RawCheckpoint::from_row,
                )
                .map_err(|e| not_found(e, "checkpoint", &id))
            })
            .await?;
        raw.decode()
    }

    /// Load the most recently saved checkpoint of a session.
    #[instrument(skip(self))]
    pub async fn load_latest(&self, session_id: &str) -> StoreResult<Checkpoint> {
        validate_id("session", session_id)?;
        let sid = session_id.to_owned();
        let raw = self
            .db
            .execute(move |conn| {
                conn.query_row(
                    &format!("{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1"),
                    rusqlite::params![sid],
                    RawCheckpoint::from_row,
                )
                .map_err(|e| not_found(e, "checkpoint for session", &sid))
            })
            .await?;
        raw.decode()
    }

    /// All checkpoints of a session, newest first.
    #[instrument(skip(self))]
    pub async fn list(&self, session_id: &str) -> StoreResult<Vec<Checkpoint>> {
        validate_id("session", session_id)?;
        let sid = session_id.to_owned();
        let rows = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY seq DESC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![sid], RawCheckpoint::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawCheckpoint::decode).collect()
    }

    /// Delete one checkpoint. Fails with `NotFound` if nothing was removed.
    #[instrument(skip(self))]
    pub async fn delete(&self, checkpoint_id: &str) -> StoreResult<()> {
        validate_id("checkpoint", checkpoint_id)?;
        let id = checkpoint_id.to_owned();
        self.db
            .execute(move |conn| {
                let removed =
                    conn.execute("DELETE FROM checkpoints WHERE id = ?1", rusqlite::params![id])?;
                if removed == 0 {
                    return Err(StoreError::NotFound {
                        entity: "checkpoint",
                        id,
                    });
                }
                Ok(())
            })
            .await?;
        debug!(checkpoint_id, "checkpoint deleted");
        Ok(())
    }

    /// Delete every checkpoint of a session and return how many were removed.
    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str) -> StoreResult<usize> {
        validate_id("session", session_id)?;
        let sid = session_id.to_owned();
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM checkpoints WHERE session_id = ?1",
                    rusqlite::params![sid],
                )?)
            })
            .await?;
        debug!(session_id, removed, "session checkpoints deleted");
        Ok(removed)
    }

    /// Number of stored checkpoints for a session.
    pub async fn count(&self, session_id: &str) -> StoreResult<usize> {
        let sid = session_id.to_owned();
        self.db
            .execute(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT count(*) FROM checkpoints WHERE session_id = ?1",
                    rusqlite::params![sid],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internals
// ═══════════════════════════════════════════════════════════════════════

const SELECT_COLUMNS: &str =
    "SELECT id, session_id, summary, metadata, messages, created_at FROM checkpoints";

/// Column values as stored, before JSON and timestamp decoding.
struct RawCheckpoint {
    id: String,
    session_id: String,
    summary: String,
    metadata: String,
    messages: String,
    created_at: String,
}

impl RawCheckpoint {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            summary: row.get(2)?,
            metadata: row.get(3)?,
            messages: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn decode(self) -> StoreResult<Checkpoint> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StoreError::Corrupt {
                entity: "checkpoint",
                id: self.id.clone(),
                reason: format!("bad created_at: {e}"),
            })?
            .with_timezone(&Utc);

        Ok(Checkpoint {
            metadata: serde_json::from_str(&self.metadata)?,
            messages: serde_json::from_str(&self.messages)?,
            id: self.id,
            session_id: self.session_id,
            summary: self.summary,
            created_at,
        })
    }
}

fn not_found(err: rusqlite::Error, entity: &'static str, id: &str) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
            entity,
            id: id.to_owned(),
        },
        other => StoreError::Sqlite(other),
    }
}

fn generate_checkpoint_id(at: DateTime<Utc>) -> String {
    let random = Uuid::now_v7().simple().to_string();
    let suffix = &random[random.len() - 8..];
    format!("cp_{}_{suffix}", at.format("%Y%m%d_%H%M%S"))
}

/// Ids may only contain ASCII alphanumerics, `-` and `_`.
fn validate_id(kind: &str, id: &str) -> StoreResult<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidArgument(format!("{kind} id is empty")));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StoreError::InvalidArgument(format!(
            "{kind} id contains invalid characters: {id}"
        )));
    }
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────
