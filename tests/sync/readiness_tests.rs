// Readiness gate behavior against real files and scripted probes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hubsync::sync::{
    ChangeDescriptor, ChangeRecord, ChannelDispatcher, FsProbe, ReadinessGate, RetryPolicy,
    SyncError,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use super::{LockedProbe, RecordingReporter};

fn gate_with(
    probe: Arc<LockedProbe>,
    policy: RetryPolicy,
) -> (
    ReadinessGate,
    tokio::sync::mpsc::UnboundedReceiver<ChangeRecord>,
    Arc<RecordingReporter>,
) {
    let (dispatcher, rx) = ChannelDispatcher::channel();
    let reporter = Arc::new(RecordingReporter::default());
    let gate = ReadinessGate::new(
        probe,
        policy,
        Arc::new(dispatcher),
        reporter.clone(),
        CancellationToken::new(),
    );
    (gate, rx, reporter)
}

#[tokio::test]
async fn test_ready_file_needs_one_probe() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ready.txt");
    std::fs::write(&path, b"done").unwrap();

    let (dispatcher, _rx) = ChannelDispatcher::channel();
    let gate = ReadinessGate::new(
        Arc::new(FsProbe),
        RetryPolicy::default(),
        Arc::new(dispatcher),
        Arc::new(RecordingReporter::default()),
        CancellationToken::new(),
    );

    assert_eq!(gate.await_readable(&path).await.unwrap(), 1);
}

#[tokio::test]
async fn test_missing_file_is_not_retried() {
    let dir = tempdir().unwrap();
    let (dispatcher, mut rx) = ChannelDispatcher::channel();
    let reporter = Arc::new(RecordingReporter::default());
    let gate = ReadinessGate::new(
        Arc::new(FsProbe),
        RetryPolicy::fixed(Duration::from_secs(3600)),
        Arc::new(dispatcher),
        reporter.clone(),
        CancellationToken::new(),
    );

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        gate.await_readable_then_emit(dir.path().join("gone.txt"), || {
            ChangeRecord::new(ChangeDescriptor::add("gone.txt"))
        }),
    )
    .await
    .unwrap();

    assert!(matches!(result, Err(SyncError::UnexpectedIo { .. })));
    assert!(rx.try_recv().is_err());
    assert_eq!(reporter.count(), 1);
}

#[tokio::test]
async fn test_exponential_backoff_still_dispatches() {
    let probe = Arc::new(LockedProbe::new(4));
    let policy = RetryPolicy {
        initial_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_attempts: Some(10),
    };
    let (gate, mut rx, reporter) = gate_with(probe.clone(), policy);

    gate.await_readable_then_emit(PathBuf::from("/watch/slow.iso"), || {
        ChangeRecord::new(ChangeDescriptor::modify("slow.iso"))
    })
    .await
    .unwrap();

    assert_eq!(probe.calls(), 5);
    assert_eq!(rx.try_recv().unwrap().change, ChangeDescriptor::modify("slow.iso"));
    assert_eq!(reporter.count(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_reported_without_dispatch() {
    let probe = Arc::new(LockedProbe::new(u32::MAX));
    let policy = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(Some(5));
    let (gate, mut rx, reporter) = gate_with(probe.clone(), policy);

    let result = gate
        .await_readable_then_emit(PathBuf::from("/watch/locked.xlsx"), || {
            ChangeRecord::new(ChangeDescriptor::modify("locked.xlsx"))
        })
        .await;

    assert!(matches!(
        result,
        Err(SyncError::RetriesExhausted { attempts: 5, .. })
    ));
    assert_eq!(probe.calls(), 5);
    assert!(rx.try_recv().is_err());
    assert_eq!(reporter.count(), 1);
}
