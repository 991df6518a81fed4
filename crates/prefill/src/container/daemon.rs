//! Worker container lifecycle: spawn, verify, teardown, reap.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, HostPathResolver,
};
use crate::config::{ContainerRuntimeConfig, PullPolicy};
use crate::mailbox::{CONTAINER_COMMANDS_DIR, CONTAINER_RESPONSES_DIR, Mailbox};

/// What a session needs from a new worker.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub mailbox: &'a Mailbox,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedContainer {
    pub container_id: String,
    pub container_name: String,
}

/// Outcome of an orphan reaping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub found: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct DaemonContainerManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: ContainerRuntimeConfig,
    host_paths: HostPathResolver,
    stop_timeout_seconds: u32,
}

impl DaemonContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        config: ContainerRuntimeConfig,
        host_paths: HostPathResolver,
        stop_timeout_seconds: u32,
    ) -> Self {
        Self {
            runtime,
            config,
            host_paths,
            stop_timeout_seconds,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    pub fn name_prefix(&self) -> &str {
        &self.config.name_prefix
    }

    pub fn container_name(&self, session_id: &str) -> String {
        format!("{}{}", self.config.name_prefix, session_id)
    }

    /// Make sure the worker image is available according to the pull policy.
    pub async fn ensure_image(&self) -> ContainerResult<()> {
        let image = &self.config.image;
        match self.config.pull_policy {
            PullPolicy::Always => {
                info!("pulling worker image {}", image);
                self.runtime.pull_image(image).await
            }
            PullPolicy::IfMissing => {
                if self.runtime.image_exists(image).await? {
                    return Ok(());
                }
                info!("worker image {} not present, pulling", image);
                self.runtime.pull_image(image).await
            }
            PullPolicy::Never => {
                if self.runtime.image_exists(image).await? {
                    Ok(())
                } else {
                    Err(ContainerError::ImageNotFound(image.clone()))
                }
            }
        }
    }

    async fn build_config(&self, request: &SpawnRequest<'_>) -> ContainerConfig {
        let commands = self
            .host_paths
            .to_host_path(request.mailbox.commands_dir())
            .await;
        let responses = self
            .host_paths
            .to_host_path(request.mailbox.responses_dir())
            .await;

        ContainerConfig::new(self.config.image.clone())
            .name(self.container_name(request.session_id))
            .label("prefill.session", request.session_id)
            .label("prefill.user", request.user_id)
            .env("PREFILL_SESSION_ID", request.session_id)
            .volume(commands.display().to_string(), CONTAINER_COMMANDS_DIR)
            .volume(responses.display().to_string(), CONTAINER_RESPONSES_DIR)
            .memory_limit(self.config.memory_limit.clone())
            .cpu_limit(self.config.cpu_limit.clone())
            .network_mode(self.config.network.clone())
            .auto_remove(true)
            .drop_capabilities(true)
            .command(vec![
                "daemon".to_string(),
                "--commands".to_string(),
                CONTAINER_COMMANDS_DIR.to_string(),
                "--responses".to_string(),
                CONTAINER_RESPONSES_DIR.to_string(),
            ])
    }

    /// Create, start and verify a worker. On any failure nothing is left running.
    pub async fn spawn(&self, request: SpawnRequest<'_>) -> ContainerResult<SpawnedContainer> {
        self.ensure_image().await?;

        let config = self.build_config(&request).await;
        let container_name = self.container_name(request.session_id);
        let container_id = self.runtime.create_container(&config).await?;
        debug!(
            "created worker {} ({}) for session {}",
            container_name, container_id, request.session_id
        );

        if let Err(e) = self.runtime.start_container(&container_id).await {
            self.discard(&container_id).await;
            return Err(e);
        }

        self.verify_started(&container_id, &container_name).await?;

        info!(
            "worker {} running for session {}",
            container_name, request.session_id
        );
        Ok(SpawnedContainer {
            container_id,
            container_name,
        })
    }

    /// Runtimes happily accept a start for a process that dies a moment later;
    /// wait out the grace period and look again.
    async fn verify_started(&self, container_id: &str, container_name: &str) -> ContainerResult<()> {
        tokio::time::sleep(Duration::from_millis(self.config.startup_grace_ms)).await;

        let inspected = self.runtime.inspect_container(container_id).await?;
        if let Some(ref info) = inspected
            && info.is_running()
        {
            return Ok(());
        }

        let exit_code = inspected.as_ref().map(|info| info.state.exit_code);
        let logs = match self
            .runtime
            .get_logs(container_id, Some(self.config.log_tail_lines))
            .await
        {
            Ok(logs) if !logs.trim().is_empty() => logs.trim().to_string(),
            Ok(_) => "(no output)".to_string(),
            Err(e) if e.is_gone() => "(container already removed; logs unavailable)".to_string(),
            Err(e) => format!("(failed to collect logs: {e})"),
        };

        warn!(
            "worker {} died during startup (exit code {:?})",
            container_name, exit_code
        );
        self.discard(container_id).await;

        Err(ContainerError::StartupCrash {
            container: container_name.to_string(),
            exit_code,
            logs,
        })
    }

    /// Force-remove, logging instead of failing.
    async fn discard(&self, container_id: &str) {
        match self.runtime.remove_container(container_id, true).await {
            Ok(()) => {}
            Err(e) if e.is_gone() => {}
            Err(e) => warn!("failed to discard container {}: {}", container_id, e),
        }
    }

    /// `Ok(false)` when the container is gone or stopped.
    pub async fn is_running(&self, container_id: &str) -> ContainerResult<bool> {
        Ok(self
            .runtime
            .inspect_container(container_id)
            .await?
            .is_some_and(|info| info.is_running()))
    }

    /// Stop (kill if stop fails), then remove. "Already gone" is success.
    pub async fn teardown(&self, container_id: &str) -> ContainerResult<()> {
        match self
            .runtime
            .stop_container(container_id, Some(self.stop_timeout_seconds))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_gone() => return Ok(()),
            Err(e) => {
                debug!("stop of {} failed ({}), killing", container_id, e);
                match self.runtime.kill_container(container_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_gone() => return Ok(()),
                    Err(e) => debug!("kill of {} failed: {}", container_id, e),
                }
            }
        }

        match self.runtime.remove_container(container_id, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tear down every prefixed container not in `live`. Each id is handled
    /// once even if the runtime lists it repeatedly; individual failures are
    /// logged and do not stop the pass.
    pub async fn reap(&self, live: &HashSet<String>) -> ContainerResult<ReapReport> {
        let listed = self
            .runtime
            .list_containers_by_name(&self.config.name_prefix)
            .await?;

        let mut seen = HashSet::new();
        let mut report = ReapReport::default();

        for container in listed {
            if !container.has_name_prefix(&self.config.name_prefix) {
                continue;
            }
            if !seen.insert(container.id.clone()) {
                continue;
            }
            let name = container.display_name().to_string();
            if live.contains(&container.id) || live.contains(&name) {
                continue;
            }

            report.found += 1;
            info!("reaping orphan worker {} ({})", name, container.id);
            match self.teardown(&container.id).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("failed to reap {} ({}): {}", name, container.id, e);
                }
            }
        }

        Ok(report)
    }
}
