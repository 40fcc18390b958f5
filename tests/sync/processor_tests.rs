// End-to-end behavior of the change processor: echo suppression,
// classification and dispatch

use std::sync::Arc;
use std::time::{Duration, Instant};

use hubsync::sync::{ChangeDescriptor, FsProbe, Notification, Outcome, RetryPolicy};
use tempfile::tempdir;

use super::{Harness, LockedProbe};

#[tokio::test]
async fn test_registered_modify_is_suppressed_once() {
    let mut harness = Harness::ready("/watch");
    harness
        .processor
        .registry()
        .register(ChangeDescriptor::modify("a.txt").key());

    harness
        .processor
        .handle(Notification::modified(harness.path("a.txt")));
    assert!(harness.drain().await.is_empty());

    // Second notification has no registration left and is genuine
    harness
        .processor
        .handle(Notification::modified(harness.path("a.txt")));
    let records = harness.drain().await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].change, ChangeDescriptor::modify("a.txt"));
}

#[tokio::test]
async fn test_n_registrations_swallow_n_notifications() {
    let mut harness = Harness::ready("/watch");
    let key = ChangeDescriptor::add("batch.bin").key();
    for _ in 0..5 {
        harness.processor.registry().register(key.clone());
    }

    let outcomes: Vec<Outcome> = (0..6)
        .map(|_| {
            harness
                .processor
                .process(Notification::created(harness.path("batch.bin")))
        })
        .collect();

    assert_eq!(&outcomes[..5], &[Outcome::Suppressed; 5]);
    assert_eq!(outcomes[5], Outcome::Deferred);

    let records = harness.drain().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].change, ChangeDescriptor::add("batch.bin"));
    assert!(harness.processor.registry().is_empty());
    assert_eq!(harness.processor.stats().suppressed, 5);
}

#[tokio::test]
async fn test_directory_notifications_never_reach_registry_or_dispatch() {
    let mut harness = Harness::ready("/watch");
    let registry = harness.processor.registry().clone();
    for change in [
        ChangeDescriptor::add("photos"),
        ChangeDescriptor::modify("photos"),
        ChangeDescriptor::delete("photos"),
        ChangeDescriptor::moved("photos", "albums"),
    ] {
        registry.register(change.key());
    }

    let dir = harness.path("photos");
    let notifications = [
        Notification::created(&dir).directory(),
        Notification::modified(&dir).directory(),
        Notification::deleted(&dir).directory(),
        Notification::moved(&dir, harness.path("albums")).directory(),
    ];
    for notification in notifications {
        assert_eq!(
            harness.processor.process(notification),
            Outcome::IgnoredDirectory
        );
    }

    assert!(harness.drain().await.is_empty());
    assert_eq!(registry.len(), 4);
}

#[tokio::test]
async fn test_move_is_dispatched_synchronously() {
    let mut harness = Harness::ready("/watch");
    harness
        .processor
        .registry()
        .register(ChangeDescriptor::moved("x.txt", "z.txt").key());

    let outcome = harness.processor.process(Notification::moved(
        harness.path("x.txt"),
        harness.path("y.txt"),
    ));
    assert_eq!(outcome, Outcome::Dispatched);

    // Already in the channel without waiting on any task
    let record = harness.records.try_recv().unwrap();
    assert_eq!(record.change, ChangeDescriptor::moved("x.txt", "y.txt"));
    assert!(harness.records.try_recv().is_err());

    // The registration for a different destination is untouched
    assert_eq!(
        harness
            .processor
            .registry()
            .pending(&ChangeDescriptor::moved("x.txt", "z.txt").key()),
        1
    );
}

#[tokio::test]
async fn test_delete_suppression_and_dispatch() {
    let mut harness = Harness::ready("/watch");
    harness
        .processor
        .registry()
        .register(ChangeDescriptor::delete("docs/old.txt").key());

    assert_eq!(
        harness
            .processor
            .process(Notification::deleted(harness.path("docs/old.txt"))),
        Outcome::Suppressed
    );
    assert_eq!(
        harness
            .processor
            .process(Notification::deleted(harness.path("docs/other.txt"))),
        Outcome::Dispatched
    );

    let records = harness.drain().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].change, ChangeDescriptor::delete("docs/other.txt"));
}

#[tokio::test]
async fn test_add_registration_does_not_suppress_modify() {
    let mut harness = Harness::ready("/watch");
    harness
        .processor
        .registry()
        .register(ChangeDescriptor::add("a.txt").key());

    harness
        .processor
        .handle(Notification::modified(harness.path("a.txt")));

    let records = harness.drain().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].change, ChangeDescriptor::modify("a.txt"));
    assert_eq!(harness.processor.registry().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_locked_file_dispatched_after_retries_without_blocking_caller() {
    let probe = Arc::new(LockedProbe::new(3));
    let mut harness = Harness::new(
        "/watch",
        probe.clone(),
        RetryPolicy::fixed(Duration::from_millis(100)),
    );
    let processor = Arc::clone(&harness.processor);

    // Deliver from a plain thread, the way the platform watcher does
    let delivery = {
        let processor = Arc::clone(&processor);
        let path = harness.path("b.bin");
        std::thread::spawn(move || {
            let started = Instant::now();
            let outcome = processor.process(Notification::created(path));
            (outcome, started.elapsed())
        })
    };
    let (outcome, elapsed) = delivery.join().unwrap();

    assert_eq!(outcome, Outcome::Deferred);
    assert!(
        elapsed < Duration::from_millis(100),
        "delivery thread blocked for {elapsed:?}"
    );

    let record = tokio::time::timeout(Duration::from_secs(5), harness.records.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.change, ChangeDescriptor::add("b.bin"));
    assert_eq!(probe.calls(), 4);

    processor.settle().await;
    assert!(harness.records.try_recv().is_err());
    assert_eq!(harness.reporter.count(), 0);
}

#[tokio::test]
async fn test_vanished_file_reported_once() {
    let dir = tempdir().unwrap();
    let mut harness = Harness::new(
        dir.path(),
        Arc::new(FsProbe),
        RetryPolicy::fixed(Duration::from_millis(5)),
    );

    harness
        .processor
        .handle(Notification::created(harness.path("c.tmp")));

    assert!(harness.drain().await.is_empty());
    assert_eq!(harness.reporter.count(), 1);
    assert!(harness.reporter.errors.lock().unwrap()[0].contains("c.tmp"));
    assert_eq!(harness.processor.stats().failed, 1);
}

#[tokio::test]
async fn test_real_file_is_dispatched() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/report.txt"), b"quarterly numbers").unwrap();
    let mut harness = Harness::new(
        dir.path(),
        Arc::new(FsProbe),
        RetryPolicy::default(),
    );

    harness
        .processor
        .handle(Notification::modified(harness.path("docs/report.txt")));

    let records = harness.drain().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].change, ChangeDescriptor::modify("docs/report.txt"));
    assert_eq!(harness.reporter.count(), 0);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_checks() {
    let probe = Arc::new(LockedProbe::new(u32::MAX));
    let mut harness = Harness::new(
        "/watch",
        probe,
        RetryPolicy::fixed(Duration::from_secs(3600)),
    );

    harness
        .processor
        .handle(Notification::modified(harness.path("held.db")));
    tokio::task::yield_now().await;
    assert_eq!(harness.processor.pending_checks(), 1);

    tokio::time::timeout(Duration::from_secs(5), harness.processor.shutdown())
        .await
        .unwrap();

    assert_eq!(harness.processor.pending_checks(), 0);
    assert!(harness.records.try_recv().is_err());
    // Cancellation is not an operator-visible failure
    assert_eq!(harness.reporter.count(), 0);
}
