//! Container runtime management.
//!
//! Drives Docker or Podman through their CLI. The runtime is auto-detected
//! or configured explicitly; [`ContainerRuntimeApi`] is the seam tests fake.

mod container;
mod daemon;
mod error;
mod host_path;

pub use container::{
    ContainerConfig, ContainerInspect, ContainerState, ContainerStateInfo, ContainerSummary,
    MountInfo,
};
pub use daemon::{DaemonContainerManager, ReapReport, SpawnRequest, SpawnedContainer};
pub use error::{ContainerError, ContainerResult};
pub use host_path::HostPathResolver;

use container::{validate_container_name, validate_image_name};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether bind mounts need the `:Z` SELinux relabel suffix.
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, RuntimeType::Podman)
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;
    /// Create without starting; returns the container id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    /// `Ok(None)` when the container does not exist.
    async fn inspect_container(&self, id_or_name: &str)
    -> ContainerResult<Option<ContainerInspect>>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn kill_container(&self, container_id: &str) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    /// All containers, running or not, whose name contains `filter`.
    async fn list_containers_by_name(&self, filter: &str)
    -> ContainerResult<Vec<ContainerSummary>>;
    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String>;
}

/// CLI-backed container runtime client.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Auto-detect: Docker if installed, else Podman.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Fails at first use with a clear spawn error.
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Build from the `container` config section.
    pub fn from_config(runtime: Option<RuntimeType>, binary: Option<&str>) -> Self {
        match (runtime, binary) {
            (Some(kind), Some(binary)) => Self::with_binary(kind, binary),
            (Some(kind), None) => Self::with_type(kind),
            (None, Some(binary)) => {
                let kind = if binary.contains("podman") {
                    RuntimeType::Podman
                } else {
                    RuntimeType::Docker
                };
                Self::with_binary(kind, binary)
            }
            (None, None) => Self::new(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn exec(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Run and require success; stdout is returned trimmed.
    async fn run(&self, command: &str, args: &[String], target: &str) -> ContainerResult<String> {
        let output = self.exec(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(command, target, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Arguments for `create`, split out so they can be checked without a runtime.
    pub fn create_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["create".to_string()];

        if let Some(ref name) = config.name {
            args.extend(["--name".to_string(), name.clone()]);
        }

        for (key, value) in &config.labels {
            args.extend(["--label".to_string(), format!("{key}={value}")]);
        }

        for (host, container) in &config.volumes {
            args.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() {
                args.push(format!("{host}:{container}:Z"));
            } else {
                args.push(format!("{host}:{container}"));
            }
        }

        if let Some(ref memory) = config.memory_limit {
            args.extend(["--memory".to_string(), memory.clone()]);
        }
        if let Some(ref cpus) = config.cpu_limit {
            args.extend(["--cpus".to_string(), cpus.clone()]);
        }

        if config.drop_capabilities {
            args.extend([
                "--cap-drop".to_string(),
                "ALL".to_string(),
                "--security-opt".to_string(),
                "no-new-privileges".to_string(),
            ]);
        }

        if config.auto_remove {
            args.push("--rm".to_string());
        }

        if let Some(ref network) = config.network_mode {
            args.extend(["--network".to_string(), network.clone()]);
        }

        for (key, value) in &config.env {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }
}

/// Map runtime stderr onto the error variants callers branch on.
fn classify_failure(command: &str, target: &str, stderr: &str) -> ContainerError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no container with name or id") {
        ContainerError::ContainerNotFound(target.to_string())
    } else if lower.contains("already in progress") {
        ContainerError::RemovalInProgress(target.to_string())
    } else if command == "image inspect" && lower.contains("no such image") {
        ContainerError::ImageNotFound(target.to_string())
    } else {
        ContainerError::CommandFailed {
            command: command.to_string(),
            message: stderr.to_string(),
        }
    }
}

/// `ps --format json` is a JSON array on Podman and JSON lines on Docker.
fn parse_ps_output(stdout: &str) -> ContainerResult<Vec<ContainerSummary>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()));
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        let args = ["image".to_string(), "inspect".to_string(), image.to_string()];
        let output = self.exec("image inspect", &args).await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;
        self.run("pull", &["pull".to_string(), image.to_string()], image)
            .await
            .map(|_| ())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let target = config.name.clone().unwrap_or_else(|| config.image.clone());
        self.run("create", &self.create_args(config), &target).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        self.run(
            "start",
            &["start".to_string(), container_id.to_string()],
            container_id,
        )
        .await
        .map(|_| ())
    }

    async fn inspect_container(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<ContainerInspect>> {
        validate_container_name(id_or_name)?;
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "json".to_string(),
            id_or_name.to_string(),
        ];
        let output = self.exec("inspect", &args).await?;
        if !output.status.success() {
            // Missing is an answer, not a failure.
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let containers: Vec<ContainerInspect> =
            serde_json::from_str(&stdout).map_err(|e| ContainerError::ParseError(e.to_string()))?;
        Ok(containers.into_iter().next())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        let mut args = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.extend(["-t".to_string(), t.to_string()]);
        }
        args.push(container_id.to_string());
        self.run("stop", &args, container_id).await.map(|_| ())
    }

    async fn kill_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        self.run(
            "kill",
            &["kill".to_string(), container_id.to_string()],
            container_id,
        )
        .await
        .map(|_| ())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());
        self.run("rm", &args, container_id).await.map(|_| ())
    }

    async fn list_containers_by_name(
        &self,
        filter: &str,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        let args = [
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name={filter}"),
            "--format".to_string(),
            "json".to_string(),
        ];
        let stdout = self.run("ps", &args, filter).await?;
        parse_ps_output(&stdout)
    }

    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        validate_container_name(container_id)?;
        let mut args = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.extend(["--tail".to_string(), n.to_string()]);
        }
        args.push(container_id.to_string());

        let output = self.exec("logs", &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("logs", container_id, stderr.trim()));
        }

        // The worker's stderr comes back on ours.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(format!("{}{}", stdout, stderr))
    }
}
