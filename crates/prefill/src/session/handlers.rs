//! Reactions to files the worker writes into the responses directory.

use log::{debug, info, warn};
use prefill_protocol::{CommandKind, ResponseFile};
use serde_json::json;

use super::registry::{SessionHandle, SessionRegistry, SessionState};
use crate::auth::{AuthState, ChallengeOutcome};
use crate::error::PrefillError;
use crate::events::{PrefillPhase, SessionEvent};
use crate::mailbox::ReadOutcome;

impl SessionRegistry {
    /// Route one coalesced notification. Never fails: a bad file is logged
    /// and skipped so later files are still handled.
    pub(super) async fn dispatch(&self, handle: &SessionHandle, file: ResponseFile) {
        match file {
            ResponseFile::Challenge(id) => self.on_challenge(handle, &id).await,
            ResponseFile::Status => self.on_status(handle).await,
            ResponseFile::Progress => self.on_progress(handle).await,
            ResponseFile::Response(_) | ResponseFile::Other => {}
        }
    }

    async fn on_challenge(&self, handle: &SessionHandle, challenge_id: &str) {
        let mut state = handle.state.lock().await;
        if !state.status.is_active() || state.auth.has_seen(challenge_id) {
            return;
        }

        let challenge = match handle.channel.read_challenge(challenge_id).await {
            ReadOutcome::Ready(challenge) => challenge,
            ReadOutcome::Missing => {
                // The worker cleaned it up already.
                debug!(
                    "challenge {} of session {} vanished before read",
                    challenge_id, handle.id
                );
                state.auth.mark_seen(challenge_id);
                return;
            }
            ReadOutcome::Malformed(reason) => {
                warn!(
                    "skipping unreadable challenge {} of session {}: {}",
                    challenge_id, handle.id, reason
                );
                return;
            }
        };

        let outcome = state.auth.observe_challenge(challenge.clone());
        if challenge.challenge_id != challenge_id {
            state.auth.mark_seen(challenge_id);
        }
        match outcome {
            ChallengeOutcome::Duplicate => {
                debug!("challenge {} already dispatched", challenge.challenge_id);
            }
            ChallengeOutcome::Accepted { changed } => {
                info!(
                    "session {} received {} challenge {}",
                    handle.id, challenge.credential_type, challenge.challenge_id
                );
                if changed.is_some() {
                    self.auth_changed(handle, &state).await;
                } else {
                    handle.publish_auth(&state);
                }
                self.notify(
                    handle,
                    SessionEvent::CredentialChallenge {
                        session_id: handle.id.clone(),
                        challenge,
                    },
                );
                self.notify_updated(handle, &state);
            }
        }
    }

    async fn on_status(&self, handle: &SessionHandle) {
        let (status, raw) = match handle.channel.read_status().await {
            ReadOutcome::Ready(read) => read,
            ReadOutcome::Missing => return,
            ReadOutcome::Malformed(reason) => {
                warn!("skipping unreadable status of session {}: {}", handle.id, reason);
                return;
            }
        };

        let mut state = handle.state.lock().await;
        if !state.status.is_active() {
            return;
        }
        if state.last_status.as_ref() == Some(&raw) {
            return;
        }
        state.last_status = Some(raw.clone());
        debug!("session {} worker status: {}", handle.id, status.status);

        self.notify(
            handle,
            SessionEvent::StatusChanged {
                session_id: handle.id.clone(),
                status: raw,
            },
        );

        if state.auth.observe_status(&status.status).is_none() {
            return;
        }
        self.auth_changed(handle, &state).await;

        if state.auth.state() == AuthState::Authenticated
            && let Some(username) = state.username.clone()
        {
            if self.is_banned(&username).await {
                self.reject_login(handle, &mut state, &username).await;
                return;
            }
        }
        self.notify_updated(handle, &state);
    }

    async fn on_progress(&self, handle: &SessionHandle) {
        let snapshot = match handle.channel.read_progress().await {
            ReadOutcome::Ready(snapshot) => snapshot,
            // Deleted when the run ends.
            ReadOutcome::Missing => return,
            ReadOutcome::Malformed(reason) => {
                warn!(
                    "skipping unreadable progress of session {}: {}",
                    handle.id, reason
                );
                return;
            }
        };

        let mut state = handle.state.lock().await;
        if !state.status.is_active() {
            return;
        }

        let reconciled = state.progress.apply(&snapshot);
        self.apply_history(handle, &reconciled.ops).await;

        if reconciled.started {
            self.set_busy(handle, &mut state, true).await;
            self.notify(
                handle,
                SessionEvent::PrefillStateChanged {
                    session_id: handle.id.clone(),
                    phase: PrefillPhase::Started,
                    message: snapshot.message.clone(),
                },
            );
        }
        if let Some(finished) = reconciled.finished {
            self.set_busy(handle, &mut state, false).await;
            if let Some(phase) = PrefillPhase::for_terminal(finished) {
                info!("prefill of session {} ended: {}", handle.id, finished);
                self.notify(
                    handle,
                    SessionEvent::PrefillStateChanged {
                        session_id: handle.id.clone(),
                        phase,
                        message: snapshot
                            .error_message
                            .clone()
                            .or_else(|| snapshot.message.clone()),
                    },
                );
            }
        }

        let notable = reconciled.is_notable();
        self.notify_progress(
            handle,
            SessionEvent::PrefillProgress {
                session_id: handle.id.clone(),
                progress: snapshot,
            },
        );
        if notable {
            self.notify_updated(handle, &state);
        }
    }

    pub(super) async fn set_busy(
        &self,
        handle: &SessionHandle,
        state: &mut SessionState,
        busy: bool,
    ) {
        if state.is_busy == busy {
            return;
        }
        state.is_busy = busy;
        if let Err(e) = self.store.set_working(&handle.id, busy).await {
            warn!("failed to persist working flag of {}: {:#}", handle.id, e);
        }
    }

    /// Ban lookup for a login in progress. A failed lookup counts as banned.
    pub(super) async fn is_banned(&self, username: &str) -> bool {
        match self.store.is_user_banned(username).await {
            Ok(banned) => banned,
            Err(e) => {
                warn!("ban check for {} failed, refusing login: {:#}", username, e);
                true
            }
        }
    }

    /// Log a banned principal out of the worker and reset the flow.
    pub(super) async fn reject_login(
        &self,
        handle: &SessionHandle,
        state: &mut SessionState,
        username: &str,
    ) -> PrefillError {
        warn!(
            "refusing login of banned user {} in session {}",
            username, handle.id
        );
        if state.auth.reset().is_some() {
            self.auth_changed(handle, state).await;
        } else {
            handle.publish_auth(state);
        }
        if let Err(e) = handle
            .channel
            .send_command(CommandKind::CancelLogin, json!({}))
            .await
        {
            warn!("failed to send cancel-login to {}: {:#}", handle.id, e);
        }

        let reason = format!("user {} is banned", username);
        self.notify(
            handle,
            SessionEvent::LoginRejected {
                session_id: handle.id.clone(),
                reason: reason.clone(),
            },
        );
        self.notify_updated(handle, state);
        PrefillError::Forbidden(reason)
    }
}
