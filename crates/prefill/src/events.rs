//! Events pushed to session subscribers.

use prefill_protocol::{CredentialChallenge, PrefillProgress, PrefillState};
use serde::Serialize;
use serde_json::Value;

use crate::auth::AuthState;
use crate::progress::HistoryStatus;
use crate::session::Session;

/// Phase reported by `prefill-state-changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefillPhase {
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl PrefillPhase {
    /// Phase announced when a run ends in `state`.
    pub fn for_terminal(state: PrefillState) -> Option<Self> {
        match state {
            PrefillState::Completed => Some(PrefillPhase::Completed),
            PrefillState::Failed | PrefillState::Error => Some(PrefillPhase::Failed),
            PrefillState::Cancelled => Some(PrefillPhase::Cancelled),
            PrefillState::Idle | PrefillState::Running => None,
        }
    }
}

/// One event for the transport layer. Serialized as `{"type": "...", ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    AuthStateChanged {
        session_id: String,
        state: AuthState,
    },
    CredentialChallenge {
        session_id: String,
        challenge: CredentialChallenge,
    },
    /// The worker's status document, forwarded as-is.
    StatusChanged {
        session_id: String,
        status: Value,
    },
    PrefillStateChanged {
        session_id: String,
        phase: PrefillPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    PrefillProgress {
        session_id: String,
        progress: PrefillProgress,
    },
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionTerminated {
        session_id: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminated_by: Option<String>,
    },
    HistoryUpdated {
        session_id: String,
        app_id: u32,
        status: HistoryStatus,
    },
    /// A banned principal reached the worker and was logged out.
    LoginRejected {
        session_id: String,
        reason: String,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::AuthStateChanged { .. } => "auth-state-changed",
            SessionEvent::CredentialChallenge { .. } => "credential-challenge",
            SessionEvent::StatusChanged { .. } => "status-changed",
            SessionEvent::PrefillStateChanged { .. } => "prefill-state-changed",
            SessionEvent::PrefillProgress { .. } => "prefill-progress",
            SessionEvent::SessionCreated { .. } => "session-created",
            SessionEvent::SessionUpdated { .. } => "session-updated",
            SessionEvent::SessionTerminated { .. } => "session-terminated",
            SessionEvent::HistoryUpdated { .. } => "history-updated",
            SessionEvent::LoginRejected { .. } => "login-rejected",
        }
    }
}
