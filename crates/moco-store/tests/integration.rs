//! Integration tests for moco-store against an on-disk SQLite file.

use moco_store::{CheckpointConfig, CheckpointStore, Database, StoreError};
use serde_json::{Map, json};

// ═══════════════════════════════════════════════════════════════════════
//  Durability
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn checkpoints_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = CheckpointConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let history = vec![
        json!({"role": "user", "content": "task A"}),
        json!({"role": "assistant", "content": "done with A"}),
    ];

    let saved = {
        let store = CheckpointStore::open(&config).await.unwrap();
        let mut meta = Map::new();
        meta.insert("turn_count".into(), json!(1));
        store.save("sess-1", &history, "first turn", meta).await.unwrap()
    };

    let reopened = CheckpointStore::open(&config).await.unwrap();
    let loaded = reopened.load_latest("sess-1").await.unwrap();
    assert_eq!(loaded.id, saved.id);
    assert_eq!(loaded.summary, "first turn");
    assert_eq!(loaded.messages, history);
}

#[tokio::test]
async fn migrate_twice_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("twice.db");

    Database::open_and_migrate(path.clone()).await.unwrap();
    let db = Database::open_and_migrate(path).await.unwrap();
    let store = CheckpointStore::new(db, 4);
    assert!(store.list("anything").await.unwrap().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Retention
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn saving_past_limit_leaves_exactly_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = CheckpointConfig {
        data_dir: dir.path().to_path_buf(),
        max_checkpoints_per_session: 4,
        ..Default::default()
    };
    let store = CheckpointStore::open(&config).await.unwrap();

    let mut first = None;
    for i in 0..9 {
        let cp = store
            .save("sess", &[json!({"n": i})], "", Map::new())
            .await
            .unwrap();
        first.get_or_insert(cp.id);
    }

    let listed = store.list("sess").await.unwrap();
    assert_eq!(listed.len(), 4);
    assert_eq!(listed[0].messages, vec![json!({"n": 8})]);
    assert_eq!(listed[3].messages, vec![json!({"n": 5})]);

    let first = first.unwrap();
    assert!(matches!(
        store.load(&first).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let config = CheckpointConfig {
        auto_save_interval: 0,
        ..Default::default()
    };
    assert!(matches!(
        CheckpointStore::open(&config).await,
        Err(StoreError::InvalidArgument(_))
    ));
}
