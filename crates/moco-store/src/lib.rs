//! # moco-store
//!
//! Persistence for the moco agent runtime.
//!
//! Checkpoints live in a single SQLite file opened in WAL mode. Every
//! write is one transaction, so a crash never leaves a half-saved snapshot
//! and retention eviction is never observed without its insert.
//!
//! ```ignore
//! use moco_store::{CheckpointConfig, CheckpointStore};
//!
//! let store = CheckpointStore::open(&CheckpointConfig::default()).await?;
//! let cp = store.save("session-1", &messages, "", Default::default()).await?;
//! let latest = store.load_latest("session-1").await?;
//! ```

pub mod checkpoint;
pub mod db;
pub mod error;
pub mod migration;

// ── re-exports ───────────────────────────────────────────────────────

pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore, should_auto_save};
pub use db::Database;
pub use error::{StoreError, StoreResult};
