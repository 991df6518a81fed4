//! In-memory session registry and lifecycle.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use log::{debug, error, info, warn};
use prefill_protocol::{CommandKind, ResponseFile};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::models::{BannedUser, HistoryEntry, Session, SessionRecord, SessionStatus};
use crate::auth::{AuthState, AuthTracker};
use crate::config::{SessionsConfig, WatcherConfig};
use crate::container::{DaemonContainerManager, SpawnRequest};
use crate::crypto::CredentialCodec;
use crate::error::{PrefillError, PrefillResult};
use crate::events::SessionEvent;
use crate::hub::EventHub;
use crate::mailbox::{CommandChannel, Mailbox};
use crate::progress::{HistoryOp, HistoryStatus, ProgressTracker};
use crate::store::{SessionStore, timestamp};
use crate::watcher::spawn_watcher;

/// Who ended a session when nobody asked for it.
pub const SYSTEM_ACTOR: &str = "system";

/// Auth state plus the id of the challenge held, published to login waiters.
pub(super) type AuthSignal = (AuthState, Option<String>);

/// Mutable session fields. Guarded by the per-session handling lock.
pub(super) struct SessionState {
    pub(super) container_id: String,
    pub(super) container_name: String,
    pub(super) status: SessionStatus,
    pub(super) auth: AuthTracker,
    pub(super) progress: ProgressTracker,
    pub(super) created_at: DateTime<Utc>,
    pub(super) expires_at: DateTime<Utc>,
    pub(super) ended_at: Option<DateTime<Utc>>,
    pub(super) last_seen_at: DateTime<Utc>,
    pub(super) is_busy: bool,
    pub(super) username: Option<String>,
    pub(super) termination_reason: Option<String>,
    /// Last status document seen, for change detection.
    pub(super) last_status: Option<Value>,
}

/// One tracked session.
pub(super) struct SessionHandle {
    pub(super) id: String,
    pub(super) user_id: String,
    /// Held while handling a worker file or running a state-changing
    /// operation, so updates for one session never interleave.
    pub(super) state: Mutex<SessionState>,
    pub(super) subscribers: DashSet<String>,
    pub(super) progress_subscribers: DashSet<String>,
    pub(super) channel: CommandChannel,
    /// Cancelled on termination; stops the watcher and every pending wait.
    pub(super) cancel: CancellationToken,
    pub(super) auth_tx: watch::Sender<AuthSignal>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHandle {
    fn add_task(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }

    fn abort_tasks(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }

    pub(super) fn publish_auth(&self, state: &SessionState) {
        let pending = state.auth.pending_challenge().map(|c| c.challenge_id.clone());
        self.auth_tx.send_replace((state.auth.state(), pending));
    }

    pub(super) fn snapshot(&self, state: &SessionState) -> Session {
        let mailbox = self.channel.mailbox();
        Session {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            container_id: state.container_id.clone(),
            container_name: state.container_name.clone(),
            commands_dir: mailbox.commands_dir().to_path_buf(),
            responses_dir: mailbox.responses_dir().to_path_buf(),
            status: state.status,
            auth_state: state.auth.state(),
            pending_challenge: state.auth.pending_challenge().cloned(),
            created_at: state.created_at,
            expires_at: state.expires_at,
            ended_at: state.ended_at,
            last_seen_at: state.last_seen_at,
            is_busy: state.is_busy,
            progress: state.progress.clone(),
            username: state.username.clone(),
            termination_reason: state.termination_reason.clone(),
            subscriber_count: self.subscribers.len(),
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub crashed: Vec<String>,
}

/// Owns every live session of this process.
///
/// Sessions are keyed by id in a concurrent map; there is no lock across
/// sessions. Creation is serialized per user so a user never ends up with
/// two active workers.
pub struct SessionRegistry {
    pub(super) sessions: DashMap<String, Arc<SessionHandle>>,
    /// Held while a user's session is being created; dropped afterwards.
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Creations hold it shared, orphan recovery exclusively, so recovery
    /// never sees a session that is persisted but not yet tracked.
    pub(super) recovery_gate: RwLock<()>,
    pub(super) containers: Arc<DaemonContainerManager>,
    pub(super) store: Arc<dyn SessionStore>,
    pub(super) hub: Arc<EventHub>,
    pub(super) codec: CredentialCodec,
    pub(super) config: SessionsConfig,
    watcher: WatcherConfig,
    pub(super) sessions_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(
        containers: Arc<DaemonContainerManager>,
        store: Arc<dyn SessionStore>,
        hub: Arc<EventHub>,
        config: SessionsConfig,
        watcher: WatcherConfig,
        sessions_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            user_locks: DashMap::new(),
            recovery_gate: RwLock::new(()),
            containers,
            store,
            hub,
            codec: CredentialCodec::new(),
            config,
            watcher,
            sessions_dir,
        })
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn containers(&self) -> &Arc<DaemonContainerManager> {
        &self.containers
    }

    /// Start a worker for `user_id`, or return the one already running.
    pub async fn create_session(self: &Arc<Self>, user_id: &str) -> PrefillResult<Session> {
        let user_lock = self
            .user_locks
            .entry(user_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = user_lock.lock().await;
            self.create_session_locked(user_id).await
        };
        // The map and this call hold the only references: nobody else waits.
        self.user_locks.remove_if(user_id, |_, lock| Arc::strong_count(lock) <= 2);
        result
    }

    /// Users with a session creation in progress.
    pub fn creations_in_progress(&self) -> usize {
        self.user_locks.len()
    }

    async fn create_session_locked(self: &Arc<Self>, user_id: &str) -> PrefillResult<Session> {
        if let Some(existing) = self.active_session_for_user(user_id).await {
            debug!(
                "user {} already has active session {}",
                user_id, existing.id
            );
            return Ok(existing);
        }

        let _creating = self.recovery_gate.read().await;
        let session_id = uuid::Uuid::new_v4().to_string();
        let mailbox = Mailbox::create(self.sessions_dir.join(&session_id))?;

        let spawned = match self
            .containers
            .spawn(SpawnRequest {
                session_id: &session_id,
                user_id,
                mailbox: &mailbox,
            })
            .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("failed to start worker for user {}: {}", user_id, e);
                remove_mailbox(&mailbox);
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let expires_at = now + self.config.session_timeout();
        let record = SessionRecord {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            container_id: Some(spawned.container_id.clone()),
            container_name: Some(spawned.container_name.clone()),
            status: SessionStatus::Active,
            username: None,
            is_authenticated: false,
            is_working: false,
            created_at: timestamp(now),
            expires_at: timestamp(expires_at),
            ended_at: None,
            last_seen_at: Some(timestamp(now)),
            termination_reason: None,
            terminated_by: None,
            cleaned_at: None,
        };
        if let Err(e) = self.store.create_session_record(&record).await {
            error!("failed to persist session {}: {:#}", session_id, e);
            self.teardown_container(&spawned.container_id).await;
            remove_mailbox(&mailbox);
            return Err(e.into());
        }

        let (auth_tx, _) = watch::channel((AuthState::NotAuthenticated, None));
        let handle = Arc::new(SessionHandle {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            state: Mutex::new(SessionState {
                container_id: spawned.container_id,
                container_name: spawned.container_name,
                status: SessionStatus::Active,
                auth: AuthTracker::new(),
                progress: ProgressTracker::new(),
                created_at: now,
                expires_at,
                ended_at: None,
                last_seen_at: now,
                is_busy: false,
                username: None,
                termination_reason: None,
                last_status: None,
            }),
            subscribers: DashSet::new(),
            progress_subscribers: DashSet::new(),
            channel: CommandChannel::new(mailbox, self.watcher.poll_interval()),
            cancel: CancellationToken::new(),
            auth_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        });
        self.sessions.insert(session_id.clone(), handle.clone());

        if self.watcher.enabled
            && let Err(e) = self.start_event_loop(&handle)
        {
            error!("failed to watch mailbox of session {}: {:#}", session_id, e);
            self.end_session(
                &session_id,
                SessionStatus::Error,
                "watcher-failed",
                Some(SYSTEM_ACTOR),
                true,
            )
            .await;
            return Err(e.into());
        }

        let session = {
            let state = handle.state.lock().await;
            handle.snapshot(&state)
        };
        info!(
            "created session {} for user {} (worker {})",
            session.id, user_id, session.container_name
        );
        self.notify(
            &handle,
            SessionEvent::SessionCreated {
                session: session.clone(),
            },
        );
        Ok(session)
    }

    /// One watcher and one consumer per session. Events of a session are
    /// handled one at a time, in arrival order.
    fn start_event_loop(self: &Arc<Self>, handle: &Arc<SessionHandle>) -> anyhow::Result<()> {
        let (watcher_task, mut files) = spawn_watcher(
            handle.channel.mailbox().responses_dir().to_path_buf(),
            &self.watcher,
            handle.cancel.child_token(),
        )?;
        handle.add_task(watcher_task);

        let registry = Arc::clone(self);
        let session = Arc::clone(handle);
        let span = tracing::info_span!("session_events", session_id = %handle.id);
        let consumer = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = session.cancel.cancelled() => break,
                        file = files.recv() => match file {
                            Some(file) => registry.dispatch(&session, file).await,
                            None => break,
                        },
                    }
                }
                debug!("event loop of session {} stopped", session.id);
            }
            .instrument(span),
        );
        handle.add_task(consumer);
        Ok(())
    }

    /// Handle one worker file for a session, as the watcher would.
    ///
    /// Exposed for deployments that run with the watcher disabled and feed
    /// notifications from elsewhere.
    pub async fn handle_response_file(
        &self,
        session_id: &str,
        file: ResponseFile,
    ) -> PrefillResult<()> {
        let handle = self.handle(session_id)?;
        self.dispatch(&handle, file).await;
        Ok(())
    }

    /// End a session: cancel pending work, shut the worker down (gracefully
    /// unless `force`), notify subscribers and release everything.
    ///
    /// Unknown or already-ended ids are a no-op. Returns whether this call
    /// ended the session.
    pub async fn terminate_session(
        &self,
        session_id: &str,
        reason: &str,
        terminated_by: Option<&str>,
        force: bool,
    ) -> bool {
        self.end_session(
            session_id,
            SessionStatus::Terminated,
            reason,
            terminated_by,
            force,
        )
        .await
    }

    pub(super) async fn end_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: &str,
        terminated_by: Option<&str>,
        force: bool,
    ) -> bool {
        let Some(handle) = self.sessions.get(session_id).map(|h| Arc::clone(h.value())) else {
            debug!("terminate of unknown session {} ignored", session_id);
            return false;
        };

        let (container_id, history_ops) = {
            let mut state = handle.state.lock().await;
            if !state.status.is_active() {
                debug!("session {} already ending", session_id);
                return false;
            }
            state.status = status;
            state.ended_at = Some(Utc::now());
            state.termination_reason = Some(reason.to_string());
            state.is_busy = false;
            (state.container_id.clone(), state.progress.cancel())
        };
        info!("ending session {} ({})", session_id, reason);

        // Wakes every wait on this session.
        handle.cancel.cancel();

        self.apply_history(&handle, &history_ops).await;
        if let Err(e) = self.store.cancel_in_progress_entries(session_id).await {
            warn!("failed to cancel history of {}: {:#}", session_id, e);
        }

        if !force {
            self.request_shutdown(&handle).await;
        }
        self.teardown_container(&container_id).await;

        match self
            .store
            .terminate_record(session_id, status, reason, terminated_by)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("record of {} was not active", session_id),
            Err(e) => warn!("failed to persist end of {}: {:#}", session_id, e),
        }

        self.notify(
            &handle,
            SessionEvent::SessionTerminated {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
                terminated_by: terminated_by.map(str::to_string),
            },
        );

        handle.abort_tasks();
        remove_mailbox(handle.channel.mailbox());
        self.sessions.remove(session_id);
        handle.subscribers.clear();
        handle.progress_subscribers.clear();
        true
    }

    /// Ask the worker to exit and give it a moment to answer.
    async fn request_shutdown(&self, handle: &SessionHandle) {
        let grace = CancellationToken::new();
        match handle
            .channel
            .request(
                CommandKind::Shutdown,
                Value::Object(Default::default()),
                self.config.shutdown_grace(),
                &grace,
            )
            .await
        {
            Ok(Some(_)) => debug!("worker of {} acknowledged shutdown", handle.id),
            Ok(None) => debug!("worker of {} did not acknowledge shutdown", handle.id),
            Err(e) => debug!("could not send shutdown to {}: {:#}", handle.id, e),
        }
    }

    async fn teardown_container(&self, container_id: &str) {
        if let Err(e) = self.containers.teardown(container_id).await {
            warn!("failed to tear down worker {}: {}", container_id, e);
        }
    }

    /// Terminate every session, e.g. on process shutdown.
    pub async fn terminate_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let ended = join_all(
            ids.iter()
                .map(|id| self.terminate_session(id, reason, Some(SYSTEM_ACTOR), false)),
        )
        .await;
        ended.into_iter().filter(|e| *e).count()
    }

    /// Expire overdue sessions and fail sessions whose worker died.
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut alive = Vec::new();

        for handle in self.handles() {
            let state = handle.state.lock().await;
            if !state.status.is_active() {
                continue;
            }
            if state.expires_at <= now {
                expired.push(handle.id.clone());
            } else {
                alive.push((handle.id.clone(), state.container_id.clone()));
            }
        }

        let mut report = SweepReport::default();
        for id in expired {
            if self
                .terminate_session(&id, "expired", Some(SYSTEM_ACTOR), false)
                .await
            {
                report.expired.push(id);
            }
        }

        for (id, container_id) in alive {
            match self.containers.is_running(&container_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("worker of session {} is no longer running", id);
                    if self
                        .end_session(
                            &id,
                            SessionStatus::Error,
                            "container-exited",
                            Some(SYSTEM_ACTOR),
                            true,
                        )
                        .await
                    {
                        report.crashed.push(id);
                    }
                }
                Err(e) => warn!("health check of session {} failed: {}", id, e),
            }
        }

        report
    }

    /// Run [`sweep`](Self::sweep) on the configured interval until `shutdown`.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = registry.sweep().await;
                        if !report.expired.is_empty() || !report.crashed.is_empty() {
                            info!(
                                "sweep: {} expired, {} crashed",
                                report.expired.len(),
                                report.crashed.len()
                            );
                        }
                    }
                }
            }
            debug!("session sweeper stopped");
        })
    }

    // ---------------------------------------------------------------------
    // Subscribers
    // ---------------------------------------------------------------------

    /// Add a listener for coarse session events.
    pub fn subscribe(&self, session_id: &str, subscriber_id: &str) -> PrefillResult<()> {
        let handle = self.handle(session_id)?;
        handle.subscribers.insert(subscriber_id.to_string());
        Ok(())
    }

    pub fn unsubscribe(&self, session_id: &str, subscriber_id: &str) {
        if let Some(handle) = self.sessions.get(session_id) {
            handle.subscribers.remove(subscriber_id);
            handle.progress_subscribers.remove(subscriber_id);
        }
    }

    /// Add a listener for raw progress snapshots.
    pub fn subscribe_progress(&self, session_id: &str, subscriber_id: &str) -> PrefillResult<()> {
        let handle = self.handle(session_id)?;
        handle.progress_subscribers.insert(subscriber_id.to_string());
        Ok(())
    }

    pub fn unsubscribe_progress(&self, session_id: &str, subscriber_id: &str) {
        if let Some(handle) = self.sessions.get(session_id) {
            handle.progress_subscribers.remove(subscriber_id);
        }
    }

    /// Coarse fan-out. Subscribers that cannot take the event are dropped.
    pub(super) fn notify(&self, handle: &SessionHandle, event: SessionEvent) {
        let targets: Vec<String> = handle.subscribers.iter().map(|s| s.key().clone()).collect();
        for (id, result) in self.hub.fan_out(&targets, &event) {
            if result.is_err() {
                handle.subscribers.remove(&id);
            }
        }
    }

    pub(super) fn notify_progress(&self, handle: &SessionHandle, event: SessionEvent) {
        let targets: Vec<String> = handle
            .progress_subscribers
            .iter()
            .map(|s| s.key().clone())
            .collect();
        for (id, result) in self.hub.fan_out(&targets, &event) {
            if result.is_err() {
                handle.progress_subscribers.remove(&id);
            }
        }
    }

    pub(super) fn notify_updated(&self, handle: &SessionHandle, state: &SessionState) {
        self.notify(
            handle,
            SessionEvent::SessionUpdated {
                session: handle.snapshot(state),
            },
        );
    }

    /// Emit an auth transition to subscribers, login waiters and the store.
    pub(super) async fn auth_changed(&self, handle: &SessionHandle, state: &SessionState) {
        let auth = state.auth.state();
        handle.publish_auth(state);
        self.notify(
            handle,
            SessionEvent::AuthStateChanged {
                session_id: handle.id.clone(),
                state: auth,
            },
        );
        if let Err(e) = self
            .store
            .set_authenticated(&handle.id, auth == AuthState::Authenticated)
            .await
        {
            warn!("failed to persist auth state of {}: {:#}", handle.id, e);
        }
    }

    /// Persist history writes and announce them.
    pub(super) async fn apply_history(&self, handle: &SessionHandle, ops: &[HistoryOp]) {
        for op in ops {
            let (app_id, status) = match op {
                HistoryOp::Start {
                    app_id,
                    app_name,
                    total_bytes,
                } => {
                    if let Err(e) = self
                        .store
                        .start_history_entry(
                            &handle.id,
                            *app_id,
                            app_name.as_deref(),
                            *total_bytes,
                        )
                        .await
                    {
                        warn!("failed to record start of app {}: {:#}", app_id, e);
                    }
                    (*app_id, HistoryStatus::InProgress)
                }
                HistoryOp::Close {
                    app_id,
                    status,
                    bytes_downloaded,
                    total_bytes,
                    error_message,
                } => {
                    match self
                        .store
                        .complete_history_entry(
                            &handle.id,
                            *app_id,
                            *status,
                            *bytes_downloaded,
                            *total_bytes,
                            error_message.as_deref(),
                        )
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => debug!("no open history entry for app {}", app_id),
                        Err(e) => warn!("failed to record end of app {}: {:#}", app_id, e),
                    }
                    (*app_id, *status)
                }
            };
            self.notify(
                handle,
                SessionEvent::HistoryUpdated {
                    session_id: handle.id.clone(),
                    app_id,
                    status,
                },
            );
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub(super) fn handle(&self, session_id: &str) -> PrefillResult<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| PrefillError::SessionNotFound(session_id.to_string()))
    }

    fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub async fn get_session(&self, session_id: &str) -> PrefillResult<Session> {
        let handle = self.handle(session_id)?;
        let state = handle.state.lock().await;
        Ok(handle.snapshot(&state))
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut sessions = Vec::new();
        for handle in self.handles() {
            let state = handle.state.lock().await;
            sessions.push(handle.snapshot(&state));
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        let mut sessions = self.list_sessions().await;
        sessions.retain(|s| s.user_id == user_id);
        sessions
    }

    async fn active_session_for_user(&self, user_id: &str) -> Option<Session> {
        for handle in self.handles() {
            if handle.user_id != user_id {
                continue;
            }
            let state = handle.state.lock().await;
            if state.status.is_active() {
                return Some(handle.snapshot(&state));
            }
        }
        None
    }

    /// Ids and container names of tracked sessions.
    pub async fn live_identifiers(&self) -> HashSet<String> {
        let mut live = HashSet::new();
        for handle in self.handles() {
            let state = handle.state.lock().await;
            live.insert(handle.id.clone());
            live.insert(state.container_id.clone());
            live.insert(state.container_name.clone());
        }
        live
    }

    /// Record that the user is still around.
    pub async fn touch(&self, session_id: &str) -> PrefillResult<()> {
        let handle = self.handle(session_id)?;
        let now = Utc::now();
        handle.state.lock().await.last_seen_at = now;
        if let Err(e) = self.store.touch_last_seen(session_id, now).await {
            debug!("failed to persist last seen of {}: {:#}", session_id, e);
        }
        Ok(())
    }

    pub async fn list_history(&self, session_id: &str) -> PrefillResult<Vec<HistoryEntry>> {
        Ok(self.store.list_history(session_id).await?)
    }

    pub async fn ban_user(
        &self,
        username: &str,
        reason: Option<&str>,
        banned_by: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> PrefillResult<()> {
        self.store
            .ban_user(username, reason, banned_by, expires_at)
            .await?;
        info!("banned {}", username);
        Ok(())
    }

    pub async fn unban_user(&self, username: &str) -> PrefillResult<bool> {
        Ok(self.store.unban_user(username).await?)
    }

    pub async fn list_bans(&self) -> PrefillResult<Vec<BannedUser>> {
        Ok(self.store.list_bans().await?)
    }
}

fn remove_mailbox(mailbox: &Mailbox) {
    if let Err(e) = mailbox.remove() {
        warn!("{:#}", e);
    }
}
