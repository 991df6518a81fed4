//! Test utilities: a fake container runtime, a scripted worker and a
//! registry wired to an in-memory database.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes_gcm::aead::OsRng;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use p256::SecretKey;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use prefill::config::{ContainerRuntimeConfig, SessionsConfig, WatcherConfig};
use prefill::container::{
    ContainerConfig, ContainerError, ContainerInspect, ContainerResult, ContainerRuntimeApi,
    ContainerState, ContainerStateInfo, ContainerSummary, DaemonContainerManager,
    HostPathResolver,
};
use prefill::db::Database;
use prefill::events::SessionEvent;
use prefill::hub::EventHub;
use prefill::session::{Session, SessionRegistry};
use prefill::store::{SessionStore, SqliteSessionStore};
use prefill_protocol::{CommandKind, CommandRequest, ResponseFile};

// ============================================================================
// Fake runtime
// ============================================================================

struct FakeContainer {
    name: String,
    running: bool,
}

/// In-memory stand-in for Docker/Podman.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    removed: Mutex<Vec<String>>,
    /// Containers exit right after start.
    pub die_on_start: AtomicBool,
    /// `ps` reports every container twice.
    pub duplicate_listing: AtomicBool,
    /// `start` blocks until [`release_start`](Self::release_start).
    pub hold_start: AtomicBool,
    start_waiting: Notify,
    start_release: Notify,
}

impl FakeRuntime {
    /// A container some earlier process left running.
    pub fn preload(&self, id: &str, name: &str) {
        self.containers.lock().unwrap().insert(
            id.to_string(),
            FakeContainer {
                name: name.to_string(),
                running: true,
            },
        );
    }

    /// Make a container's process exit.
    pub fn crash(&self, id: &str) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(id) {
            container.running = false;
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }

    pub fn created(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Ids passed to a successful remove, in order.
    pub fn removals(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn removal_count(&self, id: &str) -> usize {
        self.removals().iter().filter(|r| r.as_str() == id).count()
    }

    /// Resolves once a held `start` call is waiting.
    pub async fn wait_for_held_start(&self) {
        self.start_waiting.notified().await;
    }

    pub fn release_start(&self) {
        self.start_release.notify_one();
    }

    fn resolve(&self, id_or_name: &str) -> Option<String> {
        let containers = self.containers.lock().unwrap();
        if containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        containers
            .iter()
            .find(|(_, c)| c.name == id_or_name)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> ContainerResult<()> {
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("cid-{n}");
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                name: config.name.clone().unwrap_or_else(|| id.clone()),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        if self.hold_start.load(Ordering::SeqCst) {
            self.start_waiting.notify_one();
            self.start_release.notified().await;
        }
        let dies = self.die_on_start.load(Ordering::SeqCst);
        let mut containers = self.containers.lock().unwrap();
        let Some(container) = containers.get_mut(container_id) else {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        };
        container.running = !dies;
        Ok(())
    }

    async fn inspect_container(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<ContainerInspect>> {
        let Some(id) = self.resolve(id_or_name) else {
            return Ok(None);
        };
        let containers = self.containers.lock().unwrap();
        let Some(container) = containers.get(&id) else {
            return Ok(None);
        };
        let (status, exit_code) = if container.running {
            (ContainerState::Running, 0)
        } else {
            (ContainerState::Exited, 1)
        };
        Ok(Some(ContainerInspect {
            id: id.clone(),
            name: container.name.clone(),
            state: ContainerStateInfo {
                status,
                running: container.running,
                exit_code,
                error: String::new(),
            },
            mounts: Vec::new(),
        }))
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let Some(id) = self.resolve(container_id) else {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        };
        if let Some(container) = self.containers.lock().unwrap().get_mut(&id) {
            container.running = false;
        }
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> ContainerResult<()> {
        self.stop_container(container_id, None).await
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        let Some(id) = self.resolve(container_id) else {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        };
        self.containers.lock().unwrap().remove(&id);
        self.removed.lock().unwrap().push(id);
        Ok(())
    }

    async fn list_containers_by_name(
        &self,
        filter: &str,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        let containers = self.containers.lock().unwrap();
        let mut listed: Vec<ContainerSummary> = containers
            .iter()
            .filter(|(_, c)| c.name.contains(filter))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![c.name.clone()],
                image: "prefill-daemon:test".to_string(),
                state: if c.running {
                    ContainerState::Running
                } else {
                    ContainerState::Exited
                },
            })
            .collect();
        if self.duplicate_listing.load(Ordering::SeqCst) {
            let again = listed.clone();
            listed.extend(again);
        }
        Ok(listed)
    }

    async fn get_logs(&self, _container_id: &str, _tail: Option<u32>) -> ContainerResult<String> {
        Ok("worker exited: missing credentials volume\n".to_string())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_sessions_config() -> SessionsConfig {
    SessionsConfig {
        timeout_minutes: 120,
        sweep_interval_seconds: 60,
        command_timeout_seconds: 2,
        login_timeout_seconds: 2,
        shutdown_grace_seconds: 1,
        stop_timeout_seconds: 1,
    }
}

/// The watcher is off; tests and the fake worker dispatch files by hand.
pub fn test_watcher_config() -> WatcherConfig {
    WatcherConfig {
        enabled: false,
        poll_interval_ms: 5,
        ..Default::default()
    }
}

/// The real notify watcher with short windows.
pub fn live_watcher_config() -> WatcherConfig {
    WatcherConfig {
        enabled: true,
        dedup_window_ms: 50,
        settle_delay_ms: 10,
        poll_interval_ms: 5,
    }
}

pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<dyn SessionStore>,
    pub db: Database,
    pub sessions_dir: PathBuf,
    config: SessionsConfig,
    watcher: WatcherConfig,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_sessions_config()).await
    }

    pub async fn with_config(config: SessionsConfig) -> Self {
        Self::build(config, test_watcher_config()).await
    }

    /// Worker files reach the registry through the mailbox watcher.
    pub async fn with_watcher() -> Self {
        Self::build(test_sessions_config(), live_watcher_config()).await
    }

    async fn build(config: SessionsConfig, watcher: WatcherConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sessions_dir = dir.path().join("sessions");
        std::fs::create_dir_all(&sessions_dir).unwrap();

        let db = Database::in_memory().await.unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(db.pool().clone()));
        let runtime = Arc::new(FakeRuntime::default());
        let registry = build_registry(
            &runtime,
            &store,
            dir.path(),
            &sessions_dir,
            &config,
            &watcher,
        );

        Self {
            registry,
            runtime,
            store,
            db,
            sessions_dir,
            config,
            watcher,
            _dir: dir,
        }
    }

    /// Make every ban lookup fail from now on.
    pub async fn break_ban_list(&self) {
        sqlx::query("DROP TABLE banned_users")
            .execute(self.db.pool())
            .await
            .unwrap();
    }

    /// A fresh registry over the same store, runtime and directories, as
    /// after a process restart.
    pub fn restarted(&self) -> Arc<SessionRegistry> {
        let data_dir = self.sessions_dir.parent().unwrap().to_path_buf();
        build_registry(
            &self.runtime,
            &self.store,
            &data_dir,
            &self.sessions_dir,
            &self.config,
            &self.watcher,
        )
    }

    /// Create a session and attach a worker that acknowledges everything.
    pub async fn session_with_worker(&self, user: &str) -> (Session, FakeWorker) {
        self.session_with_script(user, Arc::new(|_: &CommandRequest| WorkerReply::ok()))
            .await
    }

    pub async fn session_with_script(&self, user: &str, script: Script) -> (Session, FakeWorker) {
        let session = self.registry.create_session(user).await.unwrap();
        let worker = FakeWorker::spawn(Arc::clone(&self.registry), &session, script);
        (session, worker)
    }
}

fn build_registry(
    runtime: &Arc<FakeRuntime>,
    store: &Arc<dyn SessionStore>,
    data_dir: &Path,
    sessions_dir: &Path,
    config: &SessionsConfig,
    watcher: &WatcherConfig,
) -> Arc<SessionRegistry> {
    let api: Arc<dyn ContainerRuntimeApi> = runtime.clone();
    let host_paths =
        HostPathResolver::new(Arc::clone(&api), data_dir.to_path_buf(), None).with_self_id(None);
    let container_config = ContainerRuntimeConfig {
        image: "prefill-daemon:test".to_string(),
        startup_grace_ms: 0,
        ..Default::default()
    };
    let containers = Arc::new(DaemonContainerManager::new(
        api,
        container_config,
        host_paths,
        config.stop_timeout_seconds,
    ));
    SessionRegistry::new(
        containers,
        Arc::clone(store),
        Arc::new(EventHub::new()),
        config.clone(),
        watcher.clone(),
        sessions_dir.to_path_buf(),
    )
}

// ============================================================================
// Fake worker
// ============================================================================

/// What the worker does with one command.
#[derive(Debug, Clone)]
pub struct WorkerReply {
    /// `None` leaves the command unanswered.
    pub response: Option<Value>,
    /// Files written (and dispatched) before the response.
    pub files: Vec<(String, Value)>,
}

impl WorkerReply {
    pub fn ok() -> Self {
        Self {
            response: Some(json!({ "success": true })),
            files: Vec::new(),
        }
    }

    pub fn data(data: Value) -> Self {
        Self {
            response: Some(json!({ "success": true, "data": data })),
            files: Vec::new(),
        }
    }

    pub fn fail(error: &str) -> Self {
        Self {
            response: Some(json!({ "success": false, "error": error })),
            files: Vec::new(),
        }
    }

    pub fn silent() -> Self {
        Self {
            response: None,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, body: Value) -> Self {
        self.files.push((name.into(), body));
        self
    }
}

pub type Script = Arc<dyn Fn(&CommandRequest) -> WorkerReply + Send + Sync>;

/// Polls the commands directory and answers like the daemon would. Files
/// it writes are dispatched to the registry in place of the watcher.
pub struct FakeWorker {
    received: Arc<Mutex<Vec<CommandRequest>>>,
    task: JoinHandle<()>,
}

impl FakeWorker {
    pub fn spawn(registry: Arc<SessionRegistry>, session: &Session, script: Script) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);
        let session_id = session.id.clone();
        let commands_dir = session.commands_dir.clone();
        let responses_dir = session.responses_dir.clone();

        let task = tokio::spawn(async move {
            let mut seen = HashSet::new();
            loop {
                for (name, request) in pending_commands(&commands_dir, &mut seen) {
                    let _ = std::fs::remove_file(commands_dir.join(&name));
                    log.lock().unwrap().push(request.clone());
                    let reply = script(&request);

                    for (file, body) in &reply.files {
                        write_json(&responses_dir, file, body);
                        let _ = registry
                            .handle_response_file(&session_id, ResponseFile::classify(file))
                            .await;
                    }
                    if let Some(mut response) = reply.response {
                        response["id"] = json!(request.id);
                        write_json(
                            &responses_dir,
                            &prefill_protocol::files::response_file_name(&request.id),
                            &response,
                        );
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        Self { received, task }
    }

    pub fn received(&self) -> Vec<CommandRequest> {
        self.received.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<CommandKind> {
        self.received().iter().map(|r| r.kind).collect()
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn pending_commands(dir: &Path, seen: &mut HashSet<String>) -> Vec<(String, CommandRequest)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("cmd_") || !name.ends_with(".json") || seen.contains(&name) {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<CommandRequest>(&text) else {
            continue;
        };
        seen.insert(name.clone());
        found.push((request.created_at, name, request));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found.into_iter().map(|(_, name, req)| (name, req)).collect()
}

/// Write a file into a mailbox directory the way the worker does: temp
/// file, then rename.
pub fn write_json(dir: &Path, name: &str, body: &Value) {
    let temp = dir.join(format!(".{name}.tmp"));
    if std::fs::write(&temp, serde_json::to_vec(body).unwrap()).is_ok() {
        let _ = std::fs::rename(&temp, dir.join(name));
    }
}

/// Write a worker file for `session` and dispatch it.
pub async fn deliver(registry: &SessionRegistry, session: &Session, name: &str, body: Value) {
    write_json(&session.responses_dir, name, &body);
    registry
        .handle_response_file(&session.id, ResponseFile::classify(name))
        .await
        .unwrap();
}

// ============================================================================
// Protocol helpers
// ============================================================================

/// A challenge file body with a real P-256 key, as the daemon writes it.
pub fn challenge_body(challenge_id: &str, credential_type: &str) -> Value {
    let secret = SecretKey::random(&mut OsRng);
    json!({
        "ChallengeId": challenge_id,
        "CredentialType": credential_type,
        "ServerPublicKey": STANDARD.encode(secret.public_key().to_sec1_bytes()),
        "CreatedAt": chrono::Utc::now().to_rfc3339(),
    })
}

pub fn challenge_file(challenge_id: &str) -> String {
    format!("auth_challenge_{challenge_id}.json")
}

pub fn status_body(status: &str) -> Value {
    json!({ "status": status, "timestamp": chrono::Utc::now().to_rfc3339() })
}

pub fn progress_body(state: &str, app: Option<u32>, bytes: u64, total: u64) -> Value {
    json!({
        "state": state,
        "currentAppId": app,
        "currentAppName": app.map(|id| format!("App {id}")),
        "bytesDownloaded": bytes,
        "totalBytes": total,
    })
}

/// Everything queued on a subscriber channel.
pub fn drain_events(rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Drain a subscriber channel and return the event names.
pub fn drain(rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> Vec<&'static str> {
    drain_events(rx).iter().map(SessionEvent::name).collect()
}
