// Renames observed through a live watcher. inotify reports each rename as
// three events, so these run on Linux only.
#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::time::Duration;

use hubsync::sync::{ChangeDescriptor, ChangeRecord, FileWatcher};
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;

use super::Harness;

/// Records received until the channel has been quiet for `quiet`.
async fn collect_until_quiet(
    records: &mut UnboundedReceiver<ChangeRecord>,
    quiet: Duration,
) -> Vec<ChangeRecord> {
    let mut received = Vec::new();
    while let Ok(Some(record)) = tokio::time::timeout(quiet, records.recv()).await {
        received.push(record);
    }
    received
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_rename_dispatches_one_move() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::write(root.join("x.txt"), "payload").unwrap();

    let mut harness = Harness::ready(&root);
    let watcher = FileWatcher::start(Arc::clone(&harness.processor)).unwrap();

    std::fs::rename(root.join("x.txt"), root.join("y.txt")).unwrap();
    let records = collect_until_quiet(&mut harness.records, Duration::from_secs(1)).await;

    let changes: Vec<_> = records.into_iter().map(|r| r.change).collect();
    assert_eq!(changes, vec![ChangeDescriptor::moved("x.txt", "y.txt")]);
    assert_eq!(harness.reporter.count(), 0);

    drop(watcher);
    harness.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registered_rename_is_fully_swallowed() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::write(root.join("x.txt"), "payload").unwrap();

    let mut harness = Harness::ready(&root);
    let key = ChangeDescriptor::moved("x.txt", "y.txt").key();
    harness.processor.registry().register(key.clone());
    let watcher = FileWatcher::start(Arc::clone(&harness.processor)).unwrap();

    std::fs::rename(root.join("x.txt"), root.join("y.txt")).unwrap();
    let records = collect_until_quiet(&mut harness.records, Duration::from_secs(1)).await;

    assert!(records.is_empty(), "{records:?}");
    assert_eq!(harness.processor.registry().pending(&key), 0);
    assert!(harness.processor.registry().is_empty());

    drop(watcher);
    harness.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_rename_dispatches_nothing() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::create_dir(root.join("sub")).unwrap();
    std::fs::write(root.join("sub").join("inner.txt"), "payload").unwrap();

    let mut harness = Harness::ready(&root);
    let watcher = FileWatcher::start(Arc::clone(&harness.processor)).unwrap();

    std::fs::rename(root.join("sub"), root.join("renamed")).unwrap();
    let records = collect_until_quiet(&mut harness.records, Duration::from_secs(1)).await;

    assert!(records.is_empty(), "{records:?}");
    assert_eq!(harness.reporter.count(), 0);

    drop(watcher);
    harness.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_created_while_watching_renames_quietly() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();

    let mut harness = Harness::ready(&root);
    let watcher = FileWatcher::start(Arc::clone(&harness.processor)).unwrap();

    std::fs::create_dir(root.join("sub")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::rename(root.join("sub"), root.join("renamed")).unwrap();
    let records = collect_until_quiet(&mut harness.records, Duration::from_secs(1)).await;

    assert!(records.is_empty(), "{records:?}");

    drop(watcher);
    harness.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_moved_out_of_root_is_delete() {
    let outside = tempdir().unwrap();
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::write(root.join("leaving.txt"), "payload").unwrap();

    let mut harness = Harness::ready(&root);
    let watcher = FileWatcher::start(Arc::clone(&harness.processor)).unwrap();

    std::fs::rename(root.join("leaving.txt"), outside.path().join("leaving.txt")).unwrap();
    let records = collect_until_quiet(&mut harness.records, Duration::from_secs(1)).await;

    let changes: Vec<_> = records.into_iter().map(|r| r.change).collect();
    assert_eq!(changes, vec![ChangeDescriptor::delete("leaving.txt")]);

    drop(watcher);
    harness.processor.shutdown().await;
}
