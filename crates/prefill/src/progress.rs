//! Turns progress snapshots into per-app history entries.
//!
//! The worker only ever reports "what I am doing right now". History needs
//! "what happened to each app", so app transitions are detected here and
//! bytes are attributed to the app they belong to.

use log::warn;
use prefill_protocol::{PrefillProgress, PrefillState};
use serde::{Deserialize, Serialize};

/// Status of one history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum HistoryStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::InProgress => "in_progress",
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Cancelled => "cancelled",
        }
    }

    /// Closing status for a run that ended in `state`.
    pub fn for_terminal(state: PrefillState) -> Option<Self> {
        match state {
            PrefillState::Completed => Some(HistoryStatus::Completed),
            PrefillState::Failed | PrefillState::Error => Some(HistoryStatus::Failed),
            PrefillState::Cancelled => Some(HistoryStatus::Cancelled),
            PrefillState::Idle | PrefillState::Running => None,
        }
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(HistoryStatus::InProgress),
            "completed" => Ok(HistoryStatus::Completed),
            "failed" => Ok(HistoryStatus::Failed),
            "cancelled" => Ok(HistoryStatus::Cancelled),
            _ => Err(format!("unknown history status: {}", s)),
        }
    }
}

/// A write the store must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOp {
    Start {
        app_id: u32,
        app_name: Option<String>,
        total_bytes: u64,
    },
    Close {
        app_id: u32,
        status: HistoryStatus,
        bytes_downloaded: u64,
        total_bytes: u64,
        error_message: Option<String>,
    },
}

/// Everything one snapshot changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub ops: Vec<HistoryOp>,
    /// The run went from not running to running.
    pub started: bool,
    /// The run ended in this terminal state.
    pub finished: Option<PrefillState>,
    /// The current app changed.
    pub transitioned: bool,
}

impl Reconciliation {
    /// Whether coarse subscribers should hear about this snapshot.
    pub fn is_notable(&self) -> bool {
        self.started || self.transitioned || self.finished.is_some()
    }
}

/// Per-session progress accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressTracker {
    pub current_app_id: Option<u32>,
    pub current_app_name: Option<String>,
    pub previous_app_id: Option<u32>,
    pub previous_app_name: Option<String>,
    /// Cumulative bytes for the session, never decreasing.
    pub total_bytes_transferred: u64,
    /// Last reported bytes of the in-flight app.
    pub current_app_bytes: u64,
    /// Last reported size of the in-flight app.
    pub current_app_total: u64,
    /// Sum of closing byte counts of finished apps.
    pub completed_bytes: u64,
    pub running: bool,
    pub last_state: Option<PrefillState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one snapshot into the tracker.
    pub fn apply(&mut self, snapshot: &PrefillProgress) -> Reconciliation {
        let mut out = Reconciliation::default();
        let terminal = snapshot.state.is_terminal();
        let reported = snapshot.current_app();

        // The same final snapshot delivered again.
        if terminal && !self.running && self.last_state == Some(snapshot.state) {
            return out;
        }

        if snapshot.state == PrefillState::Running && !self.running {
            self.running = true;
            out.started = true;
        }

        match reported {
            Some(app) if self.current_app_id != Some(app) => {
                self.close_current(HistoryStatus::Completed, None, &mut out.ops);
                self.current_app_id = Some(app);
                self.current_app_name = snapshot.current_app_name.clone();
                self.current_app_bytes = 0;
                self.current_app_total = snapshot.total_bytes;
                out.ops.push(HistoryOp::Start {
                    app_id: app,
                    app_name: snapshot.current_app_name.clone(),
                    total_bytes: snapshot.total_bytes,
                });
                out.transitioned = true;
            }
            // Between apps while still going: the previous app is done.
            None if !terminal && self.current_app_id.is_some() => {
                self.close_current(HistoryStatus::Completed, None, &mut out.ops);
                out.transitioned = true;
            }
            _ => {}
        }

        if reported.is_some() && reported == self.current_app_id {
            self.current_app_bytes = snapshot.bytes_downloaded;
            if snapshot.total_bytes > 0 {
                self.current_app_total = snapshot.total_bytes;
            }
            if self.current_app_name.is_none() {
                self.current_app_name = snapshot.current_app_name.clone();
            }
        }

        if terminal {
            if let Some(status) = HistoryStatus::for_terminal(snapshot.state) {
                let error = snapshot
                    .error_message
                    .clone()
                    .filter(|_| status == HistoryStatus::Failed);
                self.close_current(status, error, &mut out.ops);
            }
            self.running = false;
            out.finished = Some(snapshot.state);
        }

        self.update_total(snapshot.total_bytes_transferred);
        self.last_state = Some(snapshot.state);
        out
    }

    /// Close the in-flight app as cancelled, e.g. on cancel or termination.
    pub fn cancel(&mut self) -> Vec<HistoryOp> {
        let mut ops = Vec::new();
        self.close_current(HistoryStatus::Cancelled, None, &mut ops);
        self.running = false;
        self.last_state = Some(PrefillState::Cancelled);
        self.update_total(None);
        ops
    }

    fn close_current(
        &mut self,
        status: HistoryStatus,
        error_message: Option<String>,
        ops: &mut Vec<HistoryOp>,
    ) {
        let Some(app) = self.current_app_id.take() else {
            return;
        };
        ops.push(HistoryOp::Close {
            app_id: app,
            status,
            bytes_downloaded: self.current_app_bytes,
            total_bytes: self.current_app_total,
            error_message,
        });
        self.completed_bytes += self.current_app_bytes;
        self.previous_app_id = Some(app);
        self.previous_app_name = self.current_app_name.take();
        self.current_app_bytes = 0;
        self.current_app_total = 0;
    }

    /// The local floor is completed apps plus the in-flight app. A worker
    /// total is accepted only at or above that floor.
    fn update_total(&mut self, worker_total: Option<u64>) {
        let floor = self.completed_bytes + self.current_app_bytes;
        let candidate = match worker_total {
            Some(total) if total >= floor => total,
            Some(total) => {
                warn!(
                    "worker reported {} bytes transferred, below local floor {}; keeping floor",
                    total, floor
                );
                floor
            }
            None => floor,
        };
        self.total_bytes_transferred = self.total_bytes_transferred.max(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(state: PrefillState, app: Option<u32>, bytes: u64, total: u64) -> PrefillProgress {
        PrefillProgress {
            state,
            current_app_id: app,
            current_app_name: app.map(|a| format!("app {a}")),
            bytes_downloaded: bytes,
            total_bytes: total,
            total_bytes_transferred: None,
            percent_complete: None,
            bytes_per_second: None,
            total_apps: None,
            updated_apps: None,
            error_message: None,
            message: None,
        }
    }

    fn running(app: u32, bytes: u64) -> PrefillProgress {
        snap(PrefillState::Running, Some(app), bytes, 1000)
    }

    fn closes(ops: &[HistoryOp]) -> Vec<(u32, HistoryStatus, u64)> {
        ops.iter()
            .filter_map(|op| match op {
                HistoryOp::Close {
                    app_id,
                    status,
                    bytes_downloaded,
                    ..
                } => Some((*app_id, *status, *bytes_downloaded)),
                HistoryOp::Start { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_transitions_attribute_bytes_to_the_right_app() {
        let mut tracker = ProgressTracker::new();
        let mut ops = Vec::new();
        for s in [
            running(1, 100),
            running(1, 400),
            running(2, 50),
            running(2, 300),
            running(2, 900),
            running(3, 10),
            snap(PrefillState::Completed, Some(3), 700, 1000),
        ] {
            ops.extend(tracker.apply(&s).ops);
        }

        let starts: Vec<u32> = ops
            .iter()
            .filter_map(|op| match op {
                HistoryOp::Start { app_id, .. } => Some(*app_id),
                HistoryOp::Close { .. } => None,
            })
            .collect();
        assert_eq!(starts, vec![1, 2, 3]);
        assert_eq!(
            closes(&ops),
            vec![
                (1, HistoryStatus::Completed, 400),
                (2, HistoryStatus::Completed, 900),
                (3, HistoryStatus::Completed, 700),
            ]
        );
        assert_eq!(tracker.completed_bytes, 2000);
        assert_eq!(tracker.total_bytes_transferred, 2000);
    }

    #[test]
    fn test_derived_total_is_monotonic() {
        let mut tracker = ProgressTracker::new();
        let mut last = 0;
        for s in [
            running(1, 500),
            // worker restarted the download of app 1
            running(1, 20),
            running(2, 0),
            running(2, 30),
            snap(PrefillState::Idle, None, 0, 0),
        ] {
            tracker.apply(&s);
            assert!(tracker.total_bytes_transferred >= last);
            last = tracker.total_bytes_transferred;
        }
        assert_eq!(last, 500);
    }

    #[test]
    fn test_worker_total_below_floor_is_rejected() {
        let mut tracker = ProgressTracker::new();
        tracker.apply(&running(1, 800));
        tracker.apply(&running(2, 100));

        let mut lying = running(2, 200);
        lying.total_bytes_transferred = Some(50);
        tracker.apply(&lying);
        assert_eq!(tracker.total_bytes_transferred, 1000);

        let mut honest = running(2, 300);
        honest.total_bytes_transferred = Some(1500);
        tracker.apply(&honest);
        assert_eq!(tracker.total_bytes_transferred, 1500);
    }

    #[test]
    fn test_failure_records_error() {
        let mut tracker = ProgressTracker::new();
        tracker.apply(&running(7, 10));
        let mut failed = snap(PrefillState::Failed, Some(7), 25, 1000);
        failed.error_message = Some("disk full".to_string());

        let rec = tracker.apply(&failed);
        assert_eq!(rec.finished, Some(PrefillState::Failed));
        assert_eq!(
            rec.ops,
            vec![HistoryOp::Close {
                app_id: 7,
                status: HistoryStatus::Failed,
                bytes_downloaded: 25,
                total_bytes: 1000,
                error_message: Some("disk full".to_string()),
            }]
        );
        assert!(!tracker.running);
    }

    #[test]
    fn test_terminal_without_app_uses_stored_bytes() {
        let mut tracker = ProgressTracker::new();
        tracker.apply(&running(4, 60));
        let rec = tracker.apply(&snap(PrefillState::Completed, None, 0, 0));
        assert_eq!(closes(&rec.ops), vec![(4, HistoryStatus::Completed, 60)]);
    }

    #[test]
    fn test_repeated_final_snapshot_is_ignored() {
        let mut tracker = ProgressTracker::new();
        tracker.apply(&running(1, 10));
        let done = snap(PrefillState::Completed, Some(1), 10, 1000);
        assert_eq!(tracker.apply(&done).finished, Some(PrefillState::Completed));
        assert_eq!(tracker.apply(&done), Reconciliation::default());
    }

    #[test]
    fn test_started_fires_once() {
        let mut tracker = ProgressTracker::new();
        assert!(tracker.apply(&running(1, 0)).started);
        assert!(!tracker.apply(&running(1, 5)).started);
        assert!(!tracker.apply(&running(1, 6)).is_notable());
    }

    #[test]
    fn test_cancel_closes_in_flight_once() {
        let mut tracker = ProgressTracker::new();
        tracker.apply(&running(9, 33));
        assert_eq!(
            closes(&tracker.cancel()),
            vec![(9, HistoryStatus::Cancelled, 33)]
        );
        assert!(tracker.cancel().is_empty());

        // The worker confirming the cancel later changes nothing.
        let confirmed = snap(PrefillState::Cancelled, None, 0, 0);
        assert_eq!(tracker.apply(&confirmed), Reconciliation::default());
    }
}
