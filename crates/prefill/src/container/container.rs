//! Container types and configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Accept either `"a,b"` (docker ps) or `["a","b"]` (podman ps).
fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Names>::deserialize(deserializer)? {
        Some(Names::One(joined)) => joined
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect(),
        Some(Names::Many(names)) => names,
        None => Vec::new(),
    })
}

/// Configuration for creating a worker container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Arguments passed after the image.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Volume mounts (host_path -> container_path).
    pub volumes: Vec<(String, String)>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Memory cap, e.g. "2g".
    pub memory_limit: Option<String>,
    /// CPU cap, e.g. "1.5".
    pub cpu_limit: Option<String>,
    /// Network name or mode.
    pub network_mode: Option<String>,
    /// Remove the container as soon as it exits.
    pub auto_remove: bool,
    /// Drop every Linux capability and forbid privilege escalation.
    pub drop_capabilities: bool,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Everything ends up on a runtime command line, so this runs before
    /// every create.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (host_path, container_path) in &self.volumes {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
            validate_container_path(container_path)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        if let Some(ref memory) = self.memory_limit {
            validate_memory_limit(memory)?;
        }

        if let Some(ref cpus) = self.cpu_limit {
            validate_cpu_limit(cpus)?;
        }

        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn memory_limit(mut self, limit: Option<String>) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn cpu_limit(mut self, limit: Option<String>) -> Self {
        self.cpu_limit = limit;
        self
    }

    pub fn network_mode(mut self, mode: Option<String>) -> Self {
        self.network_mode = mode;
        self
    }

    pub fn auto_remove(mut self, enabled: bool) -> Self {
        self.auto_remove = enabled;
        self
    }

    pub fn drop_capabilities(mut self, enabled: bool) -> Self {
        self.drop_capabilities = enabled;
        self
    }
}

/// Container state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Still able to serve the mailbox.
    pub fn is_alive(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Restarting)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// One row of `ps --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    #[serde(alias = "ID")]
    pub id: String,

    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub state: ContainerState,
}

impl ContainerSummary {
    /// Whether any of the names starts with `prefix`. Docker sometimes
    /// reports names with a leading `/`.
    pub fn has_name_prefix(&self, prefix: &str) -> bool {
        self.names
            .iter()
            .any(|name| name.trim_start_matches('/').starts_with(prefix))
    }

    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or(&self.id)
    }
}

/// `State` block of `inspect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStateInfo {
    #[serde(default)]
    pub status: ContainerState,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub error: String,
}

/// One entry of `Mounts` in `inspect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountInfo {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
}

/// The subset of `inspect` output the orchestrator reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: ContainerStateInfo,
    #[serde(default)]
    pub mounts: Vec<MountInfo>,
}

impl ContainerInspect {
    pub fn is_running(&self) -> bool {
        self.state.running || self.state.status.is_alive()
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@');
    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container ID or name.
///
/// Container names must start with an alphanumeric character or underscore;
/// IDs are hex and satisfy the same rule.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

/// POSIX environment variable names.
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_');
    if key.is_empty() || !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' is invalid",
            key
        )));
    }
    Ok(())
}

/// Validate a volume path (host or container side).
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    // ':' would split the -v argument.
    let dangerous_chars = [
        '\0', ':', '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '*', '?', '\\',
        '"', '\'', '\n', '\r',
    ];
    if let Some(c) = path.chars().find(|c| dangerous_chars.contains(c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path contains forbidden character {:?}",
            side, c
        )));
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }
    Ok(())
}

/// `<number>[b|k|m|g]`
fn validate_memory_limit(limit: &str) -> ContainerResult<()> {
    let digits = limit.trim_end_matches(['b', 'k', 'm', 'g', 'B', 'K', 'M', 'G']);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ContainerError::InvalidInput(format!(
            "memory limit '{}' is not of the form <number>[b|k|m|g]",
            limit
        )));
    }
    Ok(())
}

fn validate_cpu_limit(limit: &str) -> ContainerResult<()> {
    match limit.parse::<f64>() {
        Ok(value) if value > 0.0 && value.is_finite() => Ok(()),
        _ => Err(ContainerError::InvalidInput(format!(
            "cpu limit '{}' must be a positive number",
            limit
        ))),
    }
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("ghcr.io/prefill/daemon:latest").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("image$(whoami)").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("prefill-daemon-1a2b").is_ok());
        assert!(validate_container_name("_private").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-starts-with-dash").is_err());
        assert!(validate_container_name("has;semicolon").is_err());
    }

    #[test]
    fn test_validate_volume_paths() {
        assert!(validate_volume_path("/srv/prefill/sessions/s1/commands", "host").is_ok());
        assert!(validate_volume_path("/path;rm -rf /", "host").is_err());
        assert!(validate_volume_path("/a:/b", "host").is_err());
        assert!(validate_volume_path("/path\0null", "host").is_err());
        assert!(validate_container_path("relative").is_err());
    }

    #[test]
    fn test_validate_limits() {
        assert!(validate_memory_limit("2g").is_ok());
        assert!(validate_memory_limit("512m").is_ok());
        assert!(validate_memory_limit("lots").is_err());
        assert!(validate_cpu_limit("1.5").is_ok());
        assert!(validate_cpu_limit("0").is_err());
        assert!(validate_cpu_limit("-1").is_err());
    }

    #[test]
    fn test_container_config_validate() {
        let config = ContainerConfig::new("prefill/daemon:1")
            .name("prefill-daemon-abc")
            .env("PREFILL_SESSION", "abc")
            .label("prefill.session", "abc")
            .volume("/host/commands", "/commands")
            .memory_limit(Some("1g".to_string()));
        assert!(config.validate().is_ok());

        let bad = ContainerConfig::new("prefill/daemon:1").volume("/host", "relative");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_summary_names_from_both_runtimes() {
        let docker: ContainerSummary = serde_json::from_str(
            r#"{"ID":"abc123","Names":"prefill-daemon-1","Image":"img","State":"running"}"#,
        )
        .unwrap();
        assert_eq!(docker.names, vec!["prefill-daemon-1"]);
        assert_eq!(docker.state, ContainerState::Running);

        let podman: ContainerSummary = serde_json::from_str(
            r#"{"Id":"def456","Names":["/prefill-daemon-2"],"State":"exited"}"#,
        )
        .unwrap();
        assert!(podman.has_name_prefix("prefill-daemon-"));
        assert_eq!(podman.display_name(), "prefill-daemon-2");
        assert_eq!(podman.state, ContainerState::Exited);
    }

    #[test]
    fn test_inspect_parsing() {
        let inspect: ContainerInspect = serde_json::from_str(
            r#"{"Id":"abc","Name":"/w","State":{"Status":"exited","Running":false,"ExitCode":137,"Error":""},
                "Mounts":[{"Source":"/srv/data","Destination":"/data","Mode":"z"}]}"#,
        )
        .unwrap();
        assert!(!inspect.is_running());
        assert_eq!(inspect.state.exit_code, 137);
        assert_eq!(inspect.mounts[0].destination, "/data");
    }
}
