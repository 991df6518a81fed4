//! Durable record of sessions, per-app history and bans.

mod sqlite;

pub use sqlite::SqliteSessionStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::progress::HistoryStatus;
use crate::session::{BannedUser, HistoryEntry, SessionRecord, SessionStatus};

/// Timestamp format used in every stored column. Fixed width, so text
/// comparison orders by time.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// What the session registry needs from persistence.
///
/// Every transition is forward-only: terminating or orphaning a row that is
/// no longer `active` is a no-op.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session_record(&self, record: &SessionRecord) -> Result<()>;

    async fn get_session_record(&self, id: &str) -> Result<Option<SessionRecord>>;

    async fn set_username(&self, id: &str, username: &str) -> Result<()>;

    async fn set_authenticated(&self, id: &str, authenticated: bool) -> Result<()>;

    async fn set_working(&self, id: &str, working: bool) -> Result<()>;

    async fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Close an active record as `Terminated` or `Error`.
    async fn terminate_record(
        &self,
        id: &str,
        status: SessionStatus,
        reason: &str,
        terminated_by: Option<&str>,
    ) -> Result<bool>;

    async fn list_active(&self) -> Result<Vec<SessionRecord>>;

    /// Most recent first; ended sessions only when `include_ended`.
    async fn list_sessions(&self, include_ended: bool) -> Result<Vec<SessionRecord>>;

    /// Flip every active record not in `keep` to `Orphaned`. Returns the ids.
    async fn mark_all_active_as_orphaned(&self, keep: &[String]) -> Result<Vec<String>>;

    /// `(session id, container id)` of orphans whose container is not yet removed.
    async fn list_orphaned_container_ids(&self) -> Result<Vec<(String, String)>>;

    async fn mark_orphaned_cleaned(&self, session_id: &str) -> Result<()>;

    async fn start_history_entry(
        &self,
        session_id: &str,
        app_id: u32,
        app_name: Option<&str>,
        total_bytes: u64,
    ) -> Result<i64>;

    /// Close the most recent in-progress entry for this app. Returns false
    /// when there was none.
    async fn complete_history_entry(
        &self,
        session_id: &str,
        app_id: u32,
        status: HistoryStatus,
        bytes_downloaded: u64,
        total_bytes: u64,
        error_message: Option<&str>,
    ) -> Result<bool>;

    /// Close every in-progress entry of a session as cancelled.
    async fn cancel_in_progress_entries(&self, session_id: &str) -> Result<u64>;

    async fn list_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>>;

    async fn is_user_banned(&self, username: &str) -> Result<bool>;

    async fn ban_user(
        &self,
        username: &str,
        reason: Option<&str>,
        banned_by: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn unban_user(&self, username: &str) -> Result<bool>;

    async fn list_bans(&self) -> Result<Vec<BannedUser>>;
}
