//! SQLite implementation of [`SessionStore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{SessionStore, timestamp};
use crate::progress::HistoryStatus;
use crate::session::{BannedUser, HistoryEntry, SessionRecord, SessionStatus};

const SESSION_COLUMNS: &str = "id, user_id, container_id, container_name, status, username, \
     is_authenticated, is_working, created_at, expires_at, ended_at, last_seen_at, \
     termination_reason, terminated_by, cleaned_at";

const HISTORY_COLUMNS: &str = "id, session_id, app_id, app_name, status, started_at, \
     completed_at, bytes_downloaded, total_bytes, error_message";

/// Byte counts are unsigned in memory and INTEGER (i64) on disk.
fn db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session_record(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prefill_sessions (
                id, user_id, container_id, container_name, status, username,
                is_authenticated, is_working, created_at, expires_at, ended_at,
                last_seen_at, termination_reason, terminated_by, cleaned_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.container_id)
        .bind(&record.container_name)
        .bind(record.status.to_string())
        .bind(&record.username)
        .bind(record.is_authenticated)
        .bind(record.is_working)
        .bind(&record.created_at)
        .bind(&record.expires_at)
        .bind(&record.ended_at)
        .bind(&record.last_seen_at)
        .bind(&record.termination_reason)
        .bind(&record.terminated_by)
        .bind(&record.cleaned_at)
        .execute(&self.pool)
        .await
        .context("creating session record")?;

        Ok(())
    }

    async fn get_session_record(&self, id: &str) -> Result<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM prefill_sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session record")?;

        Ok(record)
    }

    async fn set_username(&self, id: &str, username: &str) -> Result<()> {
        sqlx::query("UPDATE prefill_sessions SET username = ? WHERE id = ?")
            .bind(username)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting session username")?;
        Ok(())
    }

    async fn set_authenticated(&self, id: &str, authenticated: bool) -> Result<()> {
        sqlx::query("UPDATE prefill_sessions SET is_authenticated = ? WHERE id = ?")
            .bind(authenticated)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting session authentication")?;
        Ok(())
    }

    async fn set_working(&self, id: &str, working: bool) -> Result<()> {
        sqlx::query("UPDATE prefill_sessions SET is_working = ? WHERE id = ?")
            .bind(working)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting session working flag")?;
        Ok(())
    }

    async fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE prefill_sessions SET last_seen_at = ? WHERE id = ?")
            .bind(timestamp(at))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating last seen")?;
        Ok(())
    }

    async fn terminate_record(
        &self,
        id: &str,
        status: SessionStatus,
        reason: &str,
        terminated_by: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE prefill_sessions
            SET status = ?, ended_at = ?, termination_reason = ?, terminated_by = ?,
                is_working = 0
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(status.to_string())
        .bind(timestamp(Utc::now()))
        .bind(reason)
        .bind(terminated_by)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("terminating session record")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self) -> Result<Vec<SessionRecord>> {
        let records = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM prefill_sessions WHERE status = 'active' \
             ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing active sessions")?;

        Ok(records)
    }

    async fn list_sessions(&self, include_ended: bool) -> Result<Vec<SessionRecord>> {
        let filter = if include_ended {
            ""
        } else {
            "WHERE status = 'active'"
        };
        let records = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM prefill_sessions {filter} ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(records)
    }

    async fn mark_all_active_as_orphaned(&self, keep: &[String]) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        let active: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM prefill_sessions WHERE status = 'active'")
                .fetch_all(&mut *tx)
                .await
                .context("listing active sessions")?;

        let now = timestamp(Utc::now());
        let mut orphaned = Vec::new();
        for (id,) in active {
            if keep.contains(&id) {
                continue;
            }
            sqlx::query(
                r#"
                UPDATE prefill_sessions
                SET status = 'orphaned', ended_at = ?, termination_reason = 'orphaned',
                    is_working = 0
                WHERE id = ? AND status = 'active'
                "#,
            )
            .bind(&now)
            .bind(&id)
            .execute(&mut *tx)
            .await
            .context("marking session orphaned")?;
            orphaned.push(id);
        }

        tx.commit().await.context("committing orphan marks")?;
        Ok(orphaned)
    }

    async fn list_orphaned_container_ids(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, container_id FROM prefill_sessions
            WHERE status = 'orphaned' AND cleaned_at IS NULL AND container_id IS NOT NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing orphaned containers")?;

        Ok(rows)
    }

    async fn mark_orphaned_cleaned(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE prefill_sessions SET cleaned_at = ? WHERE id = ? AND status = 'orphaned'",
        )
        .bind(timestamp(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("marking orphan cleaned")?;
        Ok(())
    }

    async fn start_history_entry(
        &self,
        session_id: &str,
        app_id: u32,
        app_name: Option<&str>,
        total_bytes: u64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO prefill_history (session_id, app_id, app_name, status, started_at, total_bytes)
            VALUES (?, ?, ?, 'in_progress', ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(i64::from(app_id))
        .bind(app_name)
        .bind(timestamp(Utc::now()))
        .bind(db_int(total_bytes))
        .execute(&self.pool)
        .await
        .context("starting history entry")?;

        Ok(result.last_insert_rowid())
    }

    async fn complete_history_entry(
        &self,
        session_id: &str,
        app_id: u32,
        status: HistoryStatus,
        bytes_downloaded: u64,
        total_bytes: u64,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE prefill_history
            SET status = ?, completed_at = ?, bytes_downloaded = ?,
                total_bytes = MAX(total_bytes, ?), error_message = ?
            WHERE id = (
                SELECT id FROM prefill_history
                WHERE session_id = ? AND app_id = ? AND status = 'in_progress'
                ORDER BY id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(status.as_str())
        .bind(timestamp(Utc::now()))
        .bind(db_int(bytes_downloaded))
        .bind(db_int(total_bytes))
        .bind(error_message)
        .bind(session_id)
        .bind(i64::from(app_id))
        .execute(&self.pool)
        .await
        .context("completing history entry")?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_in_progress_entries(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE prefill_history
            SET status = 'cancelled', completed_at = ?
            WHERE session_id = ? AND status = 'in_progress'
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("cancelling in-progress history")?;

        Ok(result.rows_affected())
    }

    async fn list_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(&format!(
            "SELECT {HISTORY_COLUMNS} FROM prefill_history WHERE session_id = ? ORDER BY id"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing history")?;

        Ok(entries)
    }

    async fn is_user_banned(&self, username: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM banned_users
            WHERE username = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(username)
        .bind(timestamp(Utc::now()))
        .fetch_one(&self.pool)
        .await
        .context("checking ban list")?;

        Ok(count > 0)
    }

    async fn ban_user(
        &self,
        username: &str,
        reason: Option<&str>,
        banned_by: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO banned_users (username, reason, banned_by, banned_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(username) DO UPDATE SET
                reason = excluded.reason,
                banned_by = excluded.banned_by,
                banned_at = excluded.banned_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(username)
        .bind(reason)
        .bind(banned_by)
        .bind(timestamp(Utc::now()))
        .bind(expires_at.map(timestamp))
        .execute(&self.pool)
        .await
        .context("banning user")?;
        Ok(())
    }

    async fn unban_user(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM banned_users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await
            .context("unbanning user")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_bans(&self) -> Result<Vec<BannedUser>> {
        let bans = sqlx::query_as::<_, BannedUser>(
            r#"
            SELECT username, reason, banned_by, banned_at, expires_at
            FROM banned_users
            ORDER BY banned_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing bans")?;
        Ok(bans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration;

    async fn store() -> SqliteSessionStore {
        let db = Database::in_memory().await.unwrap();
        SqliteSessionStore::new(db.pool().clone())
    }

    fn record(id: &str, user: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            container_id: Some(format!("ctr-{id}")),
            container_name: Some(format!("prefill-daemon-{id}")),
            status: SessionStatus::Active,
            username: None,
            is_authenticated: false,
            is_working: false,
            created_at: timestamp(now),
            expires_at: timestamp(now + Duration::hours(2)),
            ended_at: None,
            last_seen_at: None,
            termination_reason: None,
            terminated_by: None,
            cleaned_at: None,
        }
    }

    #[tokio::test]
    async fn test_terminate_is_forward_only() {
        let store = store().await;
        store.create_session_record(&record("s1", "u1")).await.unwrap();

        assert!(
            store
                .terminate_record("s1", SessionStatus::Terminated, "user", Some("u1"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .terminate_record("s1", SessionStatus::Error, "late", None)
                .await
                .unwrap()
        );

        let row = store.get_session_record("s1").await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Terminated);
        assert_eq!(row.termination_reason.as_deref(), Some("user"));
        assert!(row.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_orphan_marking_respects_keep_list() {
        let store = store().await;
        store.create_session_record(&record("s1", "u1")).await.unwrap();
        store.create_session_record(&record("s2", "u2")).await.unwrap();

        let orphaned = store
            .mark_all_active_as_orphaned(&["s2".to_string()])
            .await
            .unwrap();
        assert_eq!(orphaned, vec!["s1".to_string()]);

        let containers = store.list_orphaned_container_ids().await.unwrap();
        assert_eq!(containers, vec![("s1".to_string(), "ctr-s1".to_string())]);

        store.mark_orphaned_cleaned("s1").await.unwrap();
        assert!(store.list_orphaned_container_ids().await.unwrap().is_empty());
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_closes_latest_in_progress_entry() {
        let store = store().await;
        store.create_session_record(&record("s1", "u1")).await.unwrap();

        store
            .start_history_entry("s1", 10, Some("first run"), 100)
            .await
            .unwrap();
        store
            .complete_history_entry("s1", 10, HistoryStatus::Completed, 100, 100, None)
            .await
            .unwrap();
        store.start_history_entry("s1", 10, None, 100).await.unwrap();
        store.start_history_entry("s1", 20, None, 50).await.unwrap();

        assert!(
            store
                .complete_history_entry("s1", 10, HistoryStatus::Failed, 40, 100, Some("io"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .complete_history_entry("s1", 99, HistoryStatus::Completed, 1, 1, None)
                .await
                .unwrap()
        );
        assert_eq!(store.cancel_in_progress_entries("s1").await.unwrap(), 1);

        let history = store.list_history("s1").await.unwrap();
        let statuses: Vec<HistoryStatus> = history.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![
                HistoryStatus::Completed,
                HistoryStatus::Failed,
                HistoryStatus::Cancelled
            ]
        );
        assert_eq!(history[1].bytes_downloaded, 40);
        assert_eq!(history[1].error_message.as_deref(), Some("io"));
    }

    #[tokio::test]
    async fn test_bans_are_case_insensitive_and_expire() {
        let store = store().await;
        store
            .ban_user("Griefer", Some("abuse"), Some("admin"), None)
            .await
            .unwrap();
        assert!(store.is_user_banned("griefer").await.unwrap());

        store
            .ban_user("old", None, None, Some(Utc::now() - Duration::minutes(1)))
            .await
            .unwrap();
        assert!(!store.is_user_banned("old").await.unwrap());

        assert_eq!(store.list_bans().await.unwrap().len(), 2);
        assert!(store.unban_user("GRIEFER").await.unwrap());
        assert!(!store.is_user_banned("griefer").await.unwrap());
    }
}
