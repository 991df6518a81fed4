//! Translation of our own paths into host paths for bind mounts.
//!
//! When prefilld runs inside a container, the runtime daemon resolves `-v`
//! sources on the host, not in our filesystem. We look up which of our own
//! mounts backs the data directory and rewrite the prefix.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::OnceCell;

use super::{ContainerRuntimeApi, MountInfo};

const INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HostPathResolver {
    runtime: Arc<dyn ContainerRuntimeApi>,
    data_dir: PathBuf,
    override_path: Option<PathBuf>,
    self_id: Option<String>,
    timeout: Duration,
    resolved: OnceCell<PathBuf>,
}

impl HostPathResolver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        data_dir: PathBuf,
        override_path: Option<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            data_dir,
            override_path,
            self_id: detect_self_container_id(),
            timeout: INTROSPECTION_TIMEOUT,
            resolved: OnceCell::new(),
        }
    }

    /// Replace the detected container id of this process.
    pub fn with_self_id(mut self, id: Option<String>) -> Self {
        self.self_id = id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Host path of the data directory. Computed once per process.
    pub async fn host_data_dir(&self) -> &Path {
        self.resolved.get_or_init(|| self.discover()).await
    }

    /// Rewrite a path under the data directory to its host equivalent.
    /// Paths outside the data directory are returned unchanged.
    pub async fn to_host_path(&self, internal: &Path) -> PathBuf {
        let host_root = self.host_data_dir().await;
        match internal.strip_prefix(&self.data_dir) {
            Ok(rest) => host_root.join(rest),
            Err(_) => internal.to_path_buf(),
        }
    }

    async fn discover(&self) -> PathBuf {
        if let Some(ref explicit) = self.override_path {
            info!("using configured host data path {}", explicit.display());
            return explicit.clone();
        }

        let Some(ref self_id) = self.self_id else {
            debug!("not running in a container; host paths are local paths");
            return self.data_dir.clone();
        };

        let inspected =
            tokio::time::timeout(self.timeout, self.runtime.inspect_container(self_id)).await;
        let mounts = match inspected {
            Ok(Ok(Some(info))) => info.mounts,
            Ok(Ok(None)) => {
                debug!("container {} not visible to the runtime", self_id);
                return self.data_dir.clone();
            }
            Ok(Err(e)) => {
                warn!("self-inspection of {} failed: {}", self_id, e);
                return self.data_dir.clone();
            }
            Err(_) => {
                warn!("self-inspection of {} timed out", self_id);
                return self.data_dir.clone();
            }
        };

        match translate(&self.data_dir, &mounts) {
            Some(host) => {
                info!(
                    "data directory {} is {} on the host",
                    self.data_dir.display(),
                    host.display()
                );
                host
            }
            None => {
                warn!(
                    "no mount covers {}; mounting it as-is",
                    self.data_dir.display()
                );
                self.data_dir.clone()
            }
        }
    }
}

/// Longest mount destination that is a prefix of `path` wins.
fn translate(path: &Path, mounts: &[MountInfo]) -> Option<PathBuf> {
    mounts
        .iter()
        .filter(|m| !m.source.is_empty() && !m.destination.is_empty())
        .filter_map(|m| {
            let rest = path.strip_prefix(&m.destination).ok()?;
            Some((m.destination.len(), Path::new(&m.source).join(rest)))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, host)| host)
}

/// Our own container id, if we appear to be inside one.
fn detect_self_container_id() -> Option<String> {
    let in_container =
        Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists();
    if !in_container {
        return None;
    }

    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}
