//! Per-session file mailbox: command writer and response reader.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use prefill_protocol::files::{self, DAEMON_STATUS_FILE, PREFILL_PROGRESS_FILE};
use prefill_protocol::{
    CommandKind, CommandRequest, CommandResponse, CredentialChallenge, DaemonStatus,
    PrefillProgress, from_str_ci,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Mount point of the commands directory inside the worker container.
pub const CONTAINER_COMMANDS_DIR: &str = "/commands";
/// Mount point of the responses directory inside the worker container.
pub const CONTAINER_RESPONSES_DIR: &str = "/responses";

/// The two directories shared with one worker.
#[derive(Debug, Clone)]
pub struct Mailbox {
    root: PathBuf,
    commands_dir: PathBuf,
    responses_dir: PathBuf,
}

impl Mailbox {
    /// Layout under `root`, without touching the filesystem.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            commands_dir: root.join("commands"),
            responses_dir: root.join("responses"),
            root,
        }
    }

    /// Create both directories.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let mailbox = Self::at(root);
        for dir in [&mailbox.commands_dir, &mailbox.responses_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating mailbox directory {}", dir.display()))?;
        }
        Ok(mailbox)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn commands_dir(&self) -> &Path {
        &self.commands_dir
    }

    pub fn responses_dir(&self) -> &Path {
        &self.responses_dir
    }

    /// Delete the mailbox; a missing directory is fine.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("removing mailbox {}", self.root.display()))
            }
        }
    }
}

/// Result of reading one worker-written file.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    Ready(T),
    /// Not there (yet, or any more). Never an error.
    Missing,
    /// Present but not parseable as the expected message.
    Malformed(String),
}

/// Writes commands and reads what the worker writes back.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    mailbox: Mailbox,
    poll_interval: Duration,
}

impl CommandChannel {
    pub fn new(mailbox: Mailbox, poll_interval: Duration) -> Self {
        Self {
            mailbox,
            poll_interval,
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Write one command file and return its correlation id.
    ///
    /// The file appears atomically: written under a dot-prefixed temp name,
    /// then renamed.
    pub async fn send_command(&self, kind: CommandKind, parameters: Value) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let request = CommandRequest::new(id.clone(), kind, parameters);
        let body = serde_json::to_vec_pretty(&request).context("serializing command")?;

        let final_path = self.mailbox.commands_dir.join(files::command_file_name(&id));
        let temp_path = self
            .mailbox
            .commands_dir
            .join(format!(".{}.tmp", files::command_file_name(&id)));

        tokio::fs::write(&temp_path, &body)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("publishing {}", final_path.display()))?;

        debug!("sent {} command {}", kind, id);
        Ok(id)
    }

    /// Poll for `response_<id>.json` until it parses, the deadline passes or
    /// `cancel` fires. The file is consumed on success.
    ///
    /// Missing, half-written and concurrently deleted files are retried; when
    /// the budget runs out the answer is `None`.
    pub async fn wait_for_response(
        &self,
        id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<CommandResponse> {
        let path = self.mailbox.responses_dir.join(files::response_file_name(id));
        let deadline = Instant::now() + timeout;

        loop {
            match read_message::<CommandResponse>(&path).await {
                ReadOutcome::Ready(response) => {
                    remove_if_present(&path).await;
                    return Some(response);
                }
                ReadOutcome::Malformed(reason) => {
                    debug!("response {} not readable yet: {}", id, reason);
                }
                ReadOutcome::Missing => {}
            }

            if Instant::now() >= deadline {
                debug!("no response for command {} within {:?}", id, timeout);
                return None;
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline.min(Instant::now() + self.poll_interval)) => {}
            }
        }
    }

    /// Send a command and wait for its response.
    pub async fn request(
        &self,
        kind: CommandKind,
        parameters: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<CommandResponse>> {
        let id = self.send_command(kind, parameters).await?;
        Ok(self.wait_for_response(&id, timeout, cancel).await)
    }

    pub async fn read_challenge(&self, challenge_id: &str) -> ReadOutcome<CredentialChallenge> {
        let path = self.mailbox.responses_dir.join(format!(
            "{}{}.json",
            files::CHALLENGE_PREFIX,
            challenge_id
        ));
        read_message(&path).await
    }

    /// The parsed status plus the raw document for opaque forwarding.
    pub async fn read_status(&self) -> ReadOutcome<(DaemonStatus, Value)> {
        let path = self.mailbox.responses_dir.join(DAEMON_STATUS_FILE);
        match read_raw(&path).await {
            ReadOutcome::Ready(raw) => match prefill_protocol::from_value_ci(raw.clone()) {
                Ok(status) => ReadOutcome::Ready((status, raw)),
                Err(e) => ReadOutcome::Malformed(e.to_string()),
            },
            ReadOutcome::Missing => ReadOutcome::Missing,
            ReadOutcome::Malformed(reason) => ReadOutcome::Malformed(reason),
        }
    }

    pub async fn read_progress(&self) -> ReadOutcome<PrefillProgress> {
        read_message(&self.mailbox.responses_dir.join(PREFILL_PROGRESS_FILE)).await
    }
}

async fn read_text(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Some(text),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            // Locked or mid-replace; the caller retries or treats it as gone.
            debug!("transient read failure on {}: {}", path.display(), e);
            None
        }
    }
}

async fn read_message<T: DeserializeOwned>(path: &Path) -> ReadOutcome<T> {
    let Some(text) = read_text(path).await else {
        return ReadOutcome::Missing;
    };
    if text.trim().is_empty() {
        return ReadOutcome::Malformed("empty file".to_string());
    }
    match from_str_ci(&text) {
        Ok(message) => ReadOutcome::Ready(message),
        Err(e) => ReadOutcome::Malformed(e.to_string()),
    }
}

async fn read_raw(path: &Path) -> ReadOutcome<Value> {
    let Some(text) = read_text(path).await else {
        return ReadOutcome::Missing;
    };
    match serde_json::from_str(&text) {
        Ok(value) => ReadOutcome::Ready(value),
        Err(e) => ReadOutcome::Malformed(e.to_string()),
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!("failed to remove {}: {}", path.display(), e);
    }
}
