//! Response directory watcher.
//!
//! A notify callback feeds raw paths into a channel; one task per session
//! coalesces them and publishes typed [`ResponseFile`] events. The consumer
//! handles those one at a time, so nothing here needs a lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use prefill_protocol::ResponseFile;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::WatcherConfig;

/// Coalesces notifications per path.
///
/// The first notification for a path opens a window; everything for that
/// path until the window closes is absorbed. When it closes the path is due
/// exactly once.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record a notification. Returns `false` when it was absorbed.
    pub fn observe(&mut self, path: PathBuf, now: Instant) -> bool {
        if self.pending.contains_key(&path) {
            return false;
        }
        self.pending.insert(path, now + self.window);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every path whose window has closed.
    pub fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.pending.remove(path);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Files the event loop cares about. Command responses are polled for by
/// their waiter, not dispatched.
fn classify_path(path: &Path) -> Option<ResponseFile> {
    let name = path.file_name()?.to_str()?;
    match ResponseFile::classify(name) {
        ResponseFile::Other | ResponseFile::Response(_) => None,
        interesting => Some(interesting),
    }
}

/// Start watching `dir`. Files already present are reported once at start.
pub fn spawn_watcher(
    dir: PathBuf,
    config: &WatcherConfig,
    cancel: CancellationToken,
) -> Result<(JoinHandle<()>, mpsc::Receiver<ResponseFile>)> {
    let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Result<Event>>(256);
    let mut watcher = notify::recommended_watcher(move |res| {
        if raw_tx.blocking_send(res).is_err() {
            debug!("mailbox watch channel closed");
        }
    })
    .context("initializing mailbox watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", dir.display()))?;

    let (tx, rx) = mpsc::channel(64);
    let mut debouncer = Debouncer::new(config.dedup_window());
    let settle = config.settle_delay();

    if let Ok(entries) = std::fs::read_dir(&dir) {
        let now = Instant::now();
        for entry in entries.flatten() {
            debouncer.observe(entry.path(), now);
        }
    }

    let handle = tokio::spawn(async move {
        let _watcher = watcher;

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = raw_rx.recv() => match incoming {
                    Some(Ok(event)) => {
                        if is_write(&event.kind) {
                            let now = Instant::now();
                            for path in event.paths {
                                debouncer.observe(path, now);
                            }
                        }
                    }
                    Some(Err(err)) => warn!("mailbox watcher error: {:?}", err),
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let due = debouncer.take_due(Instant::now());
                    if due.is_empty() {
                        continue;
                    }
                    sleep(settle).await;
                    for path in due {
                        let Some(file) = classify_path(&path) else {
                            continue;
                        };
                        if tx.send(file).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        debug!("mailbox watcher for {} stopped", dir.display());
    });

    Ok((handle, rx))
}
