//! End-to-end lifecycle scenarios against a real temp directory.

use serde::{Deserialize, Serialize};
use serde_json::json;

use linedb::{Engine, EngineConfigBuilder};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Item {
    name: String,
}

async fn open(dir: &std::path::Path) -> std::sync::Arc<Engine> {
    let config = EngineConfigBuilder::new(dir).build().unwrap();
    Engine::open(config).await.unwrap()
}

#[tokio::test]
async fn basic_lifecycle() {
    let dir = tempdir::TempDir::new("linedb-s1").unwrap();
    let engine = open(dir.path()).await;

    let written = engine
        .set("1", Item { name: "lemon".to_string() })
        .await
        .unwrap();
    assert_eq!(written.seq, 1);
    assert_eq!(written.rid, 1);
    assert_eq!(written.payload.name, "lemon");

    let fetched = engine.get::<Item>("1").unwrap().unwrap();
    assert_eq!(fetched.payload.name, "lemon");
    assert_eq!(fetched.seq, 1);

    engine.close().await.unwrap();

    let reopened = open(dir.path()).await;
    let fetched = reopened.get::<Item>("1").unwrap().unwrap();
    assert_eq!(fetched.payload.name, "lemon");
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn update_and_delete_across_reopen() {
    let dir = tempdir::TempDir::new("linedb-s2").unwrap();
    let engine = open(dir.path()).await;

    engine.set("k", json!({"v": 1})).await.unwrap();
    let updated = engine.set("k", json!({"v": 2})).await.unwrap();
    assert_eq!(updated.seq, 2);
    assert_eq!(updated.rid, 1);

    engine.delete("k").await.unwrap();
    assert!(!engine.has("k").unwrap());

    engine.close().await.unwrap();

    let reopened = open(dir.path()).await;
    assert!(!reopened.has("k").unwrap());
    let next = reopened.set("k", json!({"v": 3})).await.unwrap();
    assert!(next.seq >= 4);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn unicode_round_trip() {
    let dir = tempdir::TempDir::new("linedb-s3").unwrap();
    let engine = open(dir.path()).await;

    let words = ["🍋", "日本語", "Привет", "café", "🎉🎊"];
    for (i, word) in words.iter().enumerate() {
        engine
            .set(i as i64, Item { name: word.to_string() })
            .await
            .unwrap();
    }
    engine.close().await.unwrap();

    let reopened = open(dir.path()).await;
    let mut seqs = Vec::new();
    for (i, word) in words.iter().enumerate() {
        let record = reopened.get::<Item>(i as i64).unwrap().unwrap();
        assert_eq!(&record.payload.name, word);
        seqs.push(record.seq);
    }
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), seqs.len(), "every _seq must be unique");
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn recovery_ignores_residue_files() {
    let dir = tempdir::TempDir::new("linedb-s4").unwrap();
    let engine = open(dir.path()).await;
    for i in 0..50 {
        engine
            .set(format!("k{i}"), json!({"v": i}))
            .await
            .unwrap();
    }
    engine.close().await.unwrap();

    let mut block_files = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir.path()).await.unwrap();
    while let Some(entry) = read_dir.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".block") {
            block_files.push(name);
        }
    }
    assert!(!block_files.is_empty());

    let live = &block_files[0];
    tokio::fs::copy(
        dir.path().join(live),
        dir.path().join(format!("{live}.tmp")),
    )
    .await
    .unwrap();
    tokio::fs::copy(
        dir.path().join(live),
        dir.path().join(format!("{live}.old")),
    )
    .await
    .unwrap();

    let reopened = open(dir.path()).await;
    for i in 0..50 {
        assert!(reopened.has(format!("k{i}")).unwrap());
    }
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn delete_of_absent_key_is_a_no_op() {
    let dir = tempdir::TempDir::new("linedb-noop").unwrap();
    let engine = open(dir.path()).await;
    assert!(engine.delete("nope").await.is_ok());
    assert!(!engine.has("nope").unwrap());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let dir = tempdir::TempDir::new("linedb-r5").unwrap();
    let engine = open(dir.path()).await;
    engine.set("k", json!({"v": 1})).await.unwrap();
    engine.close().await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
async fn operations_after_close_fail_with_not_open() {
    let dir = tempdir::TempDir::new("linedb-closed").unwrap();
    let engine = open(dir.path()).await;
    engine.close().await.unwrap();

    let err = engine.set("k", json!({"v": 1})).await.unwrap_err();
    assert!(matches!(err, linedb::EngineError::NotOpen));
}

#[tokio::test]
async fn compaction_preserves_current_values() {
    let dir = tempdir::TempDir::new("linedb-s5").unwrap();
    let config = EngineConfigBuilder::new(dir.path())
        .max_block_size(1024)
        .stale_data_threshold(0.2)
        .build()
        .unwrap();
    let engine = Engine::open(config).await.unwrap();

    for i in 0..20 {
        engine
            .set(format!("k{i}"), json!({"v": i}))
            .await
            .unwrap();
    }
    for i in 0..10 {
        engine
            .set(format!("k{i}"), json!({"v": i + 1000}))
            .await
            .unwrap();
    }

    engine.compact_now().await.unwrap();

    for i in 0..20 {
        let expected = if i < 10 { i + 1000 } else { i };
        let record = engine
            .get::<serde_json::Value>(format!("k{i}"))
            .unwrap()
            .unwrap();
        assert_eq!(record.payload["v"], expected);
    }
    engine.close().await.unwrap();
}

#[tokio::test]
async fn opening_an_empty_directory_pre_allocates_one_block() {
    let dir = tempdir::TempDir::new("linedb-b4").unwrap();
    let engine = open(dir.path()).await;
    assert!(!engine.has("anything").unwrap());

    let mut found_block = false;
    let mut read_dir = tokio::fs::read_dir(dir.path()).await.unwrap();
    while let Some(entry) = read_dir.next_entry().await.unwrap() {
        if entry.file_name().to_string_lossy().ends_with(".block") {
            found_block = true;
        }
    }
    assert!(found_block, "expected one pre-allocated block file");
    engine.close().await.unwrap();
}

#[tokio::test]
async fn empty_line_in_a_block_fails_recovery() {
    let dir = tempdir::TempDir::new("linedb-b3").unwrap();
    {
        let engine = open(dir.path()).await;
        engine.set("k", json!({"v": 1})).await.unwrap();
        engine.close().await.unwrap();
    }

    let mut read_dir = tokio::fs::read_dir(dir.path()).await.unwrap();
    let mut block_path = None;
    while let Some(entry) = read_dir.next_entry().await.unwrap() {
        if entry.file_name().to_string_lossy().ends_with(".block") {
            block_path = Some(entry.path());
        }
    }
    let block_path = block_path.unwrap();
    let mut content = tokio::fs::read(&block_path).await.unwrap();
    content.extend_from_slice(b"\n");
    tokio::fs::write(&block_path, content).await.unwrap();

    let config = EngineConfigBuilder::new(dir.path()).build().unwrap();
    let err = Engine::open(config).await.unwrap_err();
    assert!(matches!(err, linedb::EngineError::EmptyLine { .. }));
}
