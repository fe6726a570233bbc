//! Runtime-level container configuration and the seams between the lifecycle
//! manager and a concrete container runtime.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::capabilities::default_capabilities;
use super::spec::Spec;
use crate::error::SandboxError;

/// A device node made available under `/dev`. Rootless containers cannot
/// `mknod`, so nodes are bind-mounted from the host path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    pub path: PathBuf,
    pub kind: char,
    pub major: u32,
    pub minor: u32,
    pub file_mode: u32,
}

impl DeviceRule {
    fn char_device(path: &str, major: u32, minor: u32) -> Self {
        Self {
            path: PathBuf::from(path),
            kind: 'c',
            major,
            minor,
            file_mode: 0o666,
        }
    }
}

/// Devices every container gets.
pub fn default_devices() -> Vec<DeviceRule> {
    vec![
        DeviceRule::char_device("/dev/null", 1, 3),
        DeviceRule::char_device("/dev/zero", 1, 5),
        DeviceRule::char_device("/dev/full", 1, 7),
        DeviceRule::char_device("/dev/random", 1, 8),
        DeviceRule::char_device("/dev/urandom", 1, 9),
        DeviceRule::char_device("/dev/tty", 5, 0),
    ]
}

/// `(link, target)` pairs created under `/dev`.
pub fn default_dev_symlinks() -> Vec<(PathBuf, PathBuf)> {
    [
        ("/dev/fd", "/proc/self/fd"),
        ("/dev/stdin", "/proc/self/fd/0"),
        ("/dev/stdout", "/proc/self/fd/1"),
        ("/dev/stderr", "/proc/self/fd/2"),
    ]
    .into_iter()
    .map(|(link, target)| (PathBuf::from(link), PathBuf::from(target)))
    .collect()
}

/// Everything the init helper needs to build the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(flatten)]
    pub spec: Spec,
    pub devices: Vec<DeviceRule>,
    pub dev_symlinks: Vec<(PathBuf, PathBuf)>,
    pub rootless: bool,
}

impl RuntimeConfig {
    /// Validate `spec` and attach the default devices.
    pub fn from_spec(spec: Spec) -> Result<Self, SandboxError> {
        if !spec.root.is_absolute() {
            return Err(SandboxError::InvalidSpec(format!(
                "rootfs {} is not absolute",
                spec.root.display()
            )));
        }

        let mut seen = HashSet::new();
        for mount in &spec.mounts {
            if !mount.destination.is_absolute() {
                return Err(SandboxError::InvalidSpec(format!(
                    "mount destination {} is not absolute",
                    mount.destination.display()
                )));
            }
            if !seen.insert(&mount.destination) {
                return Err(SandboxError::InvalidSpec(format!(
                    "duplicate mount destination {}",
                    mount.destination.display()
                )));
            }
        }

        for (what, maps) in [("uid", &spec.uid_mappings), ("gid", &spec.gid_mappings)] {
            if maps.is_empty() {
                return Err(SandboxError::InvalidSpec(format!("no {what} mapping")));
            }
            // Unprivileged writers may only map themselves.
            if maps.len() > 1 || maps.iter().any(|m| m.size != 1) {
                return Err(SandboxError::InvalidSpec(format!(
                    "rootless {what} mapping must be a single entry of size 1"
                )));
            }
        }

        Ok(Self {
            spec,
            devices: default_devices(),
            dev_symlinks: default_dev_symlinks(),
            rootless: true,
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<(), SandboxError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| SandboxError::InvalidSpec(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, SandboxError> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| SandboxError::InvalidSpec(e.to_string()))
    }
}

/// A process to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// `args[0]` is the absolute path of the executable.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub capabilities: Vec<String>,
    /// Whether the caller feeds stdin.
    pub stdin: bool,
}

impl ProcessSpec {
    /// The placeholder that keeps the container's namespaces alive.
    pub fn init() -> Self {
        Self {
            args: vec!["/bin/sh".into(), "-c".into(), "sleep infinity".into()],
            env: vec![(
                "PATH".into(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into(),
            )],
            cwd: PathBuf::from("/"),
            capabilities: default_capabilities(),
            stdin: false,
        }
    }
}

/// A created container. One per build session; methods take `&self` so the
/// handle can be shared with the executor.
#[async_trait]
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    /// Start the long-lived init process.
    fn start_init(&self, process: &ProcessSpec) -> Result<(), SandboxError>;

    /// Start `process` inside the running container's namespaces. The child
    /// has piped stdout/stderr, and piped stdin when `process.stdin` is set.
    async fn exec(&self, process: &ProcessSpec) -> Result<tokio::process::Child, SandboxError>;

    /// Kill everything in the container. Idempotent.
    fn destroy(&self) -> Result<(), SandboxError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ContainerRuntime: Send + Sync {
    fn create(
        &self,
        id: &str,
        state_dir: &Path,
        config: &RuntimeConfig,
    ) -> Result<Arc<dyn Container>, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::spec::{IdMapping, Mount, NamespaceKind};

    fn spec() -> Spec {
        Spec {
            root: PathBuf::from("/tmp/rootfs"),
            mounts: vec![Mount {
                destination: PathBuf::from("/dev"),
                kind: "tmpfs".into(),
                source: "tmpfs".into(),
                options: vec![],
            }],
            namespaces: vec![NamespaceKind::User, NamespaceKind::Mount],
            masked_paths: vec![PathBuf::from("/run")],
            uid_mappings: vec![IdMapping {
                container_id: 0,
                host_id: 1000,
                size: 1,
            }],
            gid_mappings: vec![IdMapping {
                container_id: 0,
                host_id: 1000,
                size: 1,
            }],
        }
    }

    #[test]
    fn test_from_spec_attaches_devices() {
        let config = RuntimeConfig::from_spec(spec()).unwrap();
        assert!(config.rootless);
        let names: Vec<_> = config
            .devices
            .iter()
            .map(|d| d.path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["/dev/null", "/dev/zero", "/dev/full", "/dev/random", "/dev/urandom", "/dev/tty"]
        );
        assert_eq!(config.dev_symlinks.len(), 4);
    }

    #[test]
    fn test_from_spec_rejects_duplicates() {
        let mut spec = spec();
        spec.mounts.push(spec.mounts[0].clone());
        let err = RuntimeConfig::from_spec(spec).unwrap_err();
        assert!(err.to_string().contains("duplicate mount destination /dev"));
    }

    #[test]
    fn test_from_spec_rejects_relative_paths() {
        let mut relative_root = spec();
        relative_root.root = PathBuf::from("rootfs");
        assert!(RuntimeConfig::from_spec(relative_root).is_err());

        let mut relative_mount = spec();
        relative_mount.mounts[0].destination = PathBuf::from("dev");
        assert!(RuntimeConfig::from_spec(relative_mount).is_err());
    }

    #[test]
    fn test_from_spec_rejects_wide_mappings() {
        let mut spec = spec();
        spec.uid_mappings[0].size = 65536;
        assert!(RuntimeConfig::from_spec(spec).is_err());

        let mut empty = self::spec();
        empty.gid_mappings.clear();
        assert!(RuntimeConfig::from_spec(empty).is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let config = RuntimeConfig::from_spec(spec()).unwrap();
        config.write_to(&path).unwrap();
        assert_eq!(RuntimeConfig::read_from(&path).unwrap(), config);
    }

    #[test]
    fn test_init_process() {
        let init = ProcessSpec::init();
        assert_eq!(init.args, vec!["/bin/sh", "-c", "sleep infinity"]);
        assert_eq!(init.capabilities, default_capabilities());
    }
}
