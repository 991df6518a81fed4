//! Startup cleanup of sessions a previous process left behind.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use super::registry::SessionRegistry;
use crate::container::DaemonContainerManager;
use crate::store::SessionStore;

/// What a recovery pass found and removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions flipped from active to orphaned.
    pub orphaned_sessions: Vec<String>,
    /// History entries closed as cancelled.
    pub cancelled_history: u64,
    pub containers_removed: usize,
    pub containers_failed: usize,
    pub mailboxes_removed: usize,
}

/// Mark persisted-but-untracked sessions as orphaned and remove their
/// workers and mailboxes.
///
/// `live` holds ids and container names/ids of sessions this process tracks;
/// they are left alone. Every container is torn down at most once per pass,
/// and a failure for one container does not stop the others.
pub async fn recover_orphans(
    store: &dyn SessionStore,
    containers: &DaemonContainerManager,
    sessions_dir: &Path,
    live: &HashSet<String>,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    let keep: Vec<String> = live.iter().cloned().collect();
    report.orphaned_sessions = store
        .mark_all_active_as_orphaned(&keep)
        .await
        .context("marking orphaned sessions")?;
    for session_id in &report.orphaned_sessions {
        match store.cancel_in_progress_entries(session_id).await {
            Ok(n) => report.cancelled_history += n,
            Err(e) => warn!("failed to close history of {}: {:#}", session_id, e),
        }
    }
    if !report.orphaned_sessions.is_empty() {
        info!(
            "marked {} session(s) orphaned",
            report.orphaned_sessions.len()
        );
    }

    let mut handled: HashSet<String> = live.clone();
    let recorded = store
        .list_orphaned_container_ids()
        .await
        .context("listing orphaned containers")?;
    for (session_id, container_id) in recorded {
        if !handled.insert(container_id.clone()) {
            mark_cleaned(store, &session_id).await;
            continue;
        }
        match containers.teardown(&container_id).await {
            Ok(()) => {
                debug!("removed worker {} of orphan {}", container_id, session_id);
                report.containers_removed += 1;
                mark_cleaned(store, &session_id).await;
            }
            Err(e) => {
                warn!(
                    "failed to remove worker {} of orphan {}: {}",
                    container_id, session_id, e
                );
                report.containers_failed += 1;
            }
        }
    }

    // Workers whose session never made it into the store.
    match containers.reap(&handled).await {
        Ok(reaped) => {
            report.containers_removed += reaped.removed;
            report.containers_failed += reaped.failed;
        }
        Err(e) => warn!("listing workers for reaping failed: {}", e),
    }

    report.mailboxes_removed = remove_stale_mailboxes(sessions_dir, live);

    info!(
        "recovery: {} orphaned, {} worker(s) removed, {} failed, {} mailbox(es) removed",
        report.orphaned_sessions.len(),
        report.containers_removed,
        report.containers_failed,
        report.mailboxes_removed
    );
    Ok(report)
}

async fn mark_cleaned(store: &dyn SessionStore, session_id: &str) {
    if let Err(e) = store.mark_orphaned_cleaned(session_id).await {
        warn!("failed to mark orphan {} cleaned: {:#}", session_id, e);
    }
}

fn remove_stale_mailboxes(sessions_dir: &Path, live: &HashSet<String>) -> usize {
    let Ok(entries) = std::fs::read_dir(sessions_dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if live.contains(&name) {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("failed to remove stale mailbox {}: {}", path.display(), e),
        }
    }
    removed
}

impl SessionRegistry {
    /// Recover orphans while sparing every session this registry tracks.
    ///
    /// Waits for creations in flight and holds new ones back until done.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport> {
        let _exclusive = self.recovery_gate.write().await;
        let live = self.live_identifiers().await;
        recover_orphans(
            self.store.as_ref(),
            self.containers.as_ref(),
            &self.sessions_dir,
            &live,
        )
        .await
    }
}
