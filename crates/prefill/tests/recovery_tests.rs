//! Restart recovery: orphaned sessions, stray workers and stale mailboxes.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use prefill::container::ContainerRuntimeApi;
use prefill::progress::HistoryStatus;
use prefill::session::SessionStatus;

mod common;
use common::{Harness, deliver, progress_body, status_body};

#[tokio::test]
async fn test_restart_orphans_and_reaps_once() {
    let h = Harness::new().await;
    let (first, _w1) = h.session_with_worker("u1").await;
    let (second, _w2) = h.session_with_worker("u2").await;
    deliver(&h.registry, &first, "daemon_status.json", status_body("logged-in")).await;
    deliver(
        &h.registry,
        &first,
        "prefill_progress.json",
        progress_body("running", Some(99), 10, 100),
    )
    .await;

    // A worker whose session never reached the store, and a container that
    // is not ours.
    h.runtime.preload("cid-stray", "prefill-daemon-stray");
    h.runtime.preload("cid-foreign", "postgres");
    h.runtime.duplicate_listing.store(true, Ordering::SeqCst);

    let restarted = h.restarted();
    let report = restarted.recover_orphans().await.unwrap();

    let mut orphaned = report.orphaned_sessions.clone();
    orphaned.sort();
    let mut expected = vec![first.id.clone(), second.id.clone()];
    expected.sort();
    assert_eq!(orphaned, expected);
    assert_eq!(report.cancelled_history, 1);
    assert_eq!(report.containers_removed, 3);
    assert_eq!(report.containers_failed, 0);
    assert_eq!(report.mailboxes_removed, 2);

    assert_eq!(h.runtime.removal_count(&first.container_id), 1);
    assert_eq!(h.runtime.removal_count(&second.container_id), 1);
    assert_eq!(h.runtime.removal_count("cid-stray"), 1);
    assert!(h.runtime.exists("cid-foreign"));
    assert!(!first.commands_dir.exists());

    for id in [&first.id, &second.id] {
        let record = h.store.get_session_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Orphaned);
        assert!(record.cleaned_at.is_some());
    }
    let history = h.store.list_history(&first.id).await.unwrap();
    assert_eq!(history[0].status, HistoryStatus::Cancelled);

    // A second pass finds nothing new.
    let again = restarted.recover_orphans().await.unwrap();
    assert!(again.orphaned_sessions.is_empty());
    assert_eq!(again.containers_removed, 0);
    assert_eq!(h.runtime.removals().len(), 3);
}

#[tokio::test]
async fn test_recovery_spares_live_sessions() {
    let h = Harness::new().await;
    let (live, _worker) = h.session_with_worker("u1").await;
    h.runtime.preload("cid-old", "prefill-daemon-old");
    std::fs::create_dir_all(h.sessions_dir.join("leftover/commands")).unwrap();

    let report = h.registry.recover_orphans().await.unwrap();
    assert!(report.orphaned_sessions.is_empty());
    assert_eq!(report.containers_removed, 1);
    assert_eq!(report.mailboxes_removed, 1);

    assert!(h.runtime.exists(&live.container_id));
    assert!(live.commands_dir.exists());
    let current = h.registry.get_session(&live.id).await.unwrap();
    assert_eq!(current.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_recovery_waits_for_sessions_being_created() {
    let h = Harness::new().await;
    h.runtime.hold_start.store(true, Ordering::SeqCst);

    let registry = Arc::clone(&h.registry);
    let creating = tokio::spawn(async move { registry.create_session("u1").await });
    // The worker container exists but the session is not tracked yet.
    h.runtime.wait_for_held_start().await;

    let registry = Arc::clone(&h.registry);
    let recovering = tokio::spawn(async move { registry.recover_orphans().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!recovering.is_finished());

    h.runtime.release_start();
    let session = creating.await.unwrap().unwrap();
    let report = recovering.await.unwrap().unwrap();

    assert!(report.orphaned_sessions.is_empty());
    assert_eq!(report.containers_removed, 0);
    assert_eq!(report.mailboxes_removed, 0);
    assert!(h.runtime.exists(&session.container_id));
    assert!(session.commands_dir.exists());

    let record = h
        .store
        .get_session_record(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_orphan_whose_worker_already_exited() {
    let h = Harness::new().await;
    let (session, _worker) = h.session_with_worker("u1").await;

    // `--rm` already took the container away.
    h.runtime.crash(&session.container_id);
    h.registry
        .containers()
        .runtime()
        .remove_container(&session.container_id, true)
        .await
        .unwrap();

    let report = h.restarted().recover_orphans().await.unwrap();
    assert_eq!(report.orphaned_sessions, vec![session.id.clone()]);
    assert_eq!(report.containers_failed, 0);

    let record = h
        .store
        .get_session_record(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SessionStatus::Orphaned);
    assert!(record.cleaned_at.is_some());
}
