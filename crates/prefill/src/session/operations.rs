//! Commands a caller can send to a session's worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use prefill_protocol::{
    CacheInfo, CommandKind, CommandResponse, CredentialChallenge, CredentialType, OwnedGame,
    PrefillOptions, from_value_ci,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use zeroize::Zeroizing;

use super::registry::{SessionHandle, SessionRegistry};
use crate::auth::AuthState;
use crate::error::{PrefillError, PrefillResult};
use crate::events::{PrefillPhase, SessionEvent};

/// Where the login flow stands once the worker has reacted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    pub state: AuthState,
    /// The credential the worker wants next, if any.
    pub challenge: Option<CredentialChallenge>,
}

impl SessionRegistry {
    /// Resolve a session that accepts commands, and mark it as seen.
    async fn active_handle(&self, session_id: &str) -> PrefillResult<Arc<SessionHandle>> {
        let handle = self.handle(session_id)?;
        {
            let mut state = handle.state.lock().await;
            if !state.status.is_active() {
                return Err(PrefillError::SessionNotActive(session_id.to_string()));
            }
            state.last_seen_at = Utc::now();
        }
        Ok(handle)
    }

    async fn authenticated_handle(&self, session_id: &str) -> PrefillResult<Arc<SessionHandle>> {
        let handle = self.active_handle(session_id).await?;
        if handle.state.lock().await.auth.state() != AuthState::Authenticated {
            return Err(PrefillError::NotAuthenticated(session_id.to_string()));
        }
        Ok(handle)
    }

    /// Send a command and require a successful answer.
    async fn command(
        &self,
        handle: &SessionHandle,
        kind: CommandKind,
        parameters: Value,
        timeout: Duration,
    ) -> PrefillResult<CommandResponse> {
        let response = handle
            .channel
            .request(kind, parameters, timeout, &handle.cancel)
            .await?;
        match response {
            None => Err(PrefillError::NoResponse {
                command: kind.to_string(),
            }),
            Some(response) if !response.success => Err(PrefillError::CommandFailed {
                command: kind.to_string(),
                message: response.failure_text(),
            }),
            Some(response) => Ok(response),
        }
    }

    async fn query<T: DeserializeOwned>(
        &self,
        handle: &SessionHandle,
        kind: CommandKind,
    ) -> PrefillResult<T> {
        let response = self
            .command(handle, kind, json!({}), self.config.command_timeout())
            .await?;
        from_value_ci(response.data.unwrap_or(Value::Null))
            .map_err(|e| PrefillError::Protocol(format!("{} response: {}", kind, e)))
    }

    /// Ask the worker to log in and wait until it either wants a credential
    /// or reports that it is logged in.
    pub async fn start_login(&self, session_id: &str) -> PrefillResult<LoginOutcome> {
        let handle = self.active_handle(session_id).await?;
        {
            let mut state = handle.state.lock().await;
            if state.auth.state() == AuthState::Authenticated {
                return Ok(LoginOutcome {
                    state: AuthState::Authenticated,
                    challenge: None,
                });
            }
            if state.auth.begin_login().is_some() {
                self.auth_changed(&handle, &state).await;
            } else {
                handle.publish_auth(&state);
            }
        }

        let mut auth_rx = handle.auth_tx.subscribe();
        let timeout = self.config.login_timeout();
        let command_id = handle
            .channel
            .send_command(CommandKind::Login, json!({}))
            .await?;
        info!("session {} logging in", session_id);

        let ack = handle
            .channel
            .wait_for_response(&command_id, timeout, &handle.cancel);
        tokio::pin!(ack);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut acked = false;

        loop {
            {
                let (auth, pending) = &*auth_rx.borrow_and_update();
                if *auth != AuthState::LoggingIn || pending.is_some() {
                    break;
                }
            }
            tokio::select! {
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        return Err(PrefillError::SessionNotActive(session_id.to_string()));
                    }
                }
                response = &mut ack, if !acked => {
                    acked = true;
                    if let Some(response) = response
                        && !response.success
                    {
                        self.abandon_login(&handle).await;
                        return Err(PrefillError::CommandFailed {
                            command: CommandKind::Login.to_string(),
                            message: response.failure_text(),
                        });
                    }
                }
                _ = handle.cancel.cancelled() => {
                    return Err(PrefillError::SessionNotActive(session_id.to_string()));
                }
                _ = &mut deadline => {
                    debug!("session {} login saw no worker reaction", session_id);
                    return Err(PrefillError::NoResponse {
                        command: CommandKind::Login.to_string(),
                    });
                }
            }
        }

        let state = handle.state.lock().await;
        Ok(LoginOutcome {
            state: state.auth.state(),
            challenge: state.auth.pending_challenge().cloned(),
        })
    }

    async fn abandon_login(&self, handle: &SessionHandle) {
        let mut state = handle.state.lock().await;
        if state.auth.reset().is_some() {
            self.auth_changed(handle, &state).await;
        }
    }

    /// Answer the pending challenge. The credential is encrypted for this
    /// challenge only and dropped (wiped) when the call returns.
    ///
    /// A username is checked against the ban list before it leaves the
    /// process; a banned user gets [`PrefillError::Forbidden`].
    pub async fn provide_credential(
        &self,
        session_id: &str,
        challenge_id: &str,
        credential: String,
    ) -> PrefillResult<()> {
        let credential = Zeroizing::new(credential);
        let handle = self.active_handle(session_id).await?;

        let envelope = {
            let mut state = handle.state.lock().await;
            let Some(challenge) = state
                .auth
                .pending_challenge()
                .filter(|c| c.challenge_id == challenge_id)
                .cloned()
            else {
                return Err(PrefillError::ChallengeNotFound(challenge_id.to_string()));
            };

            if challenge.credential_type == CredentialType::Username {
                let username = credential.trim().to_string();
                if self.is_banned(&username).await {
                    return Err(self.reject_login(&handle, &mut state, &username).await);
                }
                if let Err(e) = self.store.set_username(&handle.id, &username).await {
                    warn!("failed to persist username of {}: {:#}", handle.id, e);
                }
                state.username = Some(username);
            }

            let envelope = self.codec.encrypt(&challenge, &credential)?;
            state.auth.claim_challenge(challenge_id);
            handle.publish_auth(&state);
            self.notify_updated(&handle, &state);
            envelope
        };

        let parameters = serde_json::to_value(&envelope)
            .map_err(|e| PrefillError::Internal(anyhow::Error::new(e)))?;
        self.command(
            &handle,
            CommandKind::ProvideCredential,
            parameters,
            self.config.command_timeout(),
        )
        .await?;
        debug!(
            "session {} answered challenge {}",
            session_id, challenge_id
        );
        Ok(())
    }

    /// Abort the login flow. The session is back at `NotAuthenticated`
    /// whatever state it was in, even if the worker does not answer.
    pub async fn cancel_login(&self, session_id: &str) -> PrefillResult<()> {
        let handle = self.active_handle(session_id).await?;
        {
            let mut state = handle.state.lock().await;
            if state.auth.reset().is_some() {
                self.auth_changed(&handle, &state).await;
            } else {
                handle.publish_auth(&state);
            }
            self.notify_updated(&handle, &state);
        }
        self.command(
            &handle,
            CommandKind::CancelLogin,
            json!({}),
            self.config.command_timeout(),
        )
        .await?;
        Ok(())
    }

    pub async fn set_selected_apps(&self, session_id: &str, app_ids: &[u32]) -> PrefillResult<()> {
        let handle = self.authenticated_handle(session_id).await?;
        self.command(
            &handle,
            CommandKind::SetSelectedApps,
            json!({ "appIds": app_ids }),
            self.config.command_timeout(),
        )
        .await?;
        Ok(())
    }

    pub async fn get_selected_apps(&self, session_id: &str) -> PrefillResult<Vec<u32>> {
        let handle = self.authenticated_handle(session_id).await?;
        self.query(&handle, CommandKind::GetSelectedApps).await
    }

    /// Start a prefill run. Progress arrives through the watcher.
    pub async fn start_prefill(
        &self,
        session_id: &str,
        options: &PrefillOptions,
    ) -> PrefillResult<()> {
        let handle = self.authenticated_handle(session_id).await?;
        let parameters = serde_json::to_value(options)
            .map_err(|e| PrefillError::Internal(anyhow::Error::new(e)))?;
        self.command(
            &handle,
            CommandKind::Prefill,
            parameters,
            self.config.command_timeout(),
        )
        .await?;

        let mut state = handle.state.lock().await;
        if state.status.is_active() {
            self.set_busy(&handle, &mut state, true).await;
            self.notify_updated(&handle, &state);
        }
        info!("session {} prefill requested", session_id);
        Ok(())
    }

    /// Stop the current run. The app in flight is recorded as cancelled.
    pub async fn cancel_prefill(&self, session_id: &str) -> PrefillResult<()> {
        let handle = self.active_handle(session_id).await?;
        self.command(
            &handle,
            CommandKind::CancelPrefill,
            json!({}),
            self.config.command_timeout(),
        )
        .await?;

        let mut state = handle.state.lock().await;
        if !state.status.is_active() {
            return Ok(());
        }
        let was_busy = state.is_busy;
        let ops = state.progress.cancel();
        self.apply_history(&handle, &ops).await;
        self.set_busy(&handle, &mut state, false).await;
        if was_busy || !ops.is_empty() {
            self.notify(
                &handle,
                SessionEvent::PrefillStateChanged {
                    session_id: handle.id.clone(),
                    phase: PrefillPhase::Cancelled,
                    message: None,
                },
            );
        }
        self.notify_updated(&handle, &state);
        Ok(())
    }

    pub async fn get_owned_games(&self, session_id: &str) -> PrefillResult<Vec<OwnedGame>> {
        let handle = self.authenticated_handle(session_id).await?;
        self.query(&handle, CommandKind::GetOwnedGames).await
    }

    pub async fn get_cache_info(&self, session_id: &str) -> PrefillResult<CacheInfo> {
        let handle = self.active_handle(session_id).await?;
        self.query(&handle, CommandKind::GetCacheInfo).await
    }

    pub async fn clear_cache(&self, session_id: &str) -> PrefillResult<()> {
        let handle = self.active_handle(session_id).await?;
        self.command(
            &handle,
            CommandKind::ClearCache,
            json!({}),
            self.config.command_timeout(),
        )
        .await?;
        Ok(())
    }

    /// The worker's own view of its state, as it reports it.
    pub async fn get_status(&self, session_id: &str) -> PrefillResult<Value> {
        let handle = self.active_handle(session_id).await?;
        let response = self
            .command(
                &handle,
                CommandKind::GetStatus,
                json!({}),
                self.config.command_timeout(),
            )
            .await?;
        Ok(response.data.unwrap_or(Value::Null))
    }
}
