//! Session data models.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use prefill_protocol::CredentialChallenge;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::auth::AuthState;
use crate::progress::{HistoryStatus, ProgressTracker};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Worker container is up and tracked in memory.
    Active,
    /// Ended normally (user, expiry, shutdown).
    Terminated,
    /// Ended because the container died or could not be driven.
    Error,
    /// Persisted as active but not tracked by this process. Store only.
    Orphaned,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Terminated => write!(f, "terminated"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Orphaned => write!(f, "orphaned"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "terminated" => Ok(SessionStatus::Terminated),
            "error" => Ok(SessionStatus::Error),
            "orphaned" => Ok(SessionStatus::Orphaned),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// Read-only view of a live session, handed to callers and subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
    pub commands_dir: PathBuf,
    pub responses_dir: PathBuf,
    pub status: SessionStatus,
    pub auth_state: AuthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_challenge: Option<CredentialChallenge>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub is_busy: bool,
    pub progress: ProgressTracker,
    /// Login name captured from the username credential. Never a secret.
    pub username: Option<String>,
    pub termination_reason: Option<String>,
    pub subscriber_count: usize,
}

/// A `prefill_sessions` row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub status: SessionStatus,
    pub username: Option<String>,
    pub is_authenticated: bool,
    pub is_working: bool,
    pub created_at: String,
    pub expires_at: String,
    pub ended_at: Option<String>,
    pub last_seen_at: Option<String>,
    pub termination_reason: Option<String>,
    pub terminated_by: Option<String>,
    pub cleaned_at: Option<String>,
}

/// A `prefill_history` row: what happened to one app in one session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub session_id: String,
    pub app_id: i64,
    pub app_name: Option<String>,
    pub status: HistoryStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub bytes_downloaded: i64,
    pub total_bytes: i64,
    pub error_message: Option<String>,
}

/// A `banned_users` row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BannedUser {
    pub username: String,
    pub reason: Option<String>,
    pub banned_by: Option<String>,
    pub banned_at: String,
    pub expires_at: Option<String>,
}
