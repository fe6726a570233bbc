//! Container description for one build session: mounts, namespaces, id maps.
//!
//! Mounts are layered in a fixed order: `/dev` tmpfs, `/proc`, host system
//! directories, scratch tmpfs over host state, then the workspace binds. Later
//! layers win, so the workspace is visible even when it lives under a scratch
//! tmpfs such as the home directory.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::{User, getuid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SandboxError;

/// Host directories bind-mounted read-write into every container.
pub const SYSTEM_DIRS: [&str; 9] = [
    "/bin", "/sbin", "/lib", "/lib64", "/usr", "/var", "/etc", "/opt", "/run",
];

/// Paths covered by an empty read-only tmpfs inside the container.
pub const MASKED_PATHS: [&str; 1] = ["/run"];

const DEV_TMPFS_OPTIONS: [&str; 4] = ["nosuid", "strictatime", "mode=755", "size=65536k"];
const SCRATCH_TMPFS_OPTIONS: [&str; 5] = ["nosuid", "noexec", "nodev", "size=16M", "rprivate"];

/// How `/proc` is provided inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcMode {
    /// A fresh procfs for the container's PID namespace.
    Isolated,
    /// Read-only recursive bind of the host `/proc`.
    HostReadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    fn new(destination: impl Into<PathBuf>, kind: &str, source: impl Into<String>, options: &[&str]) -> Self {
        Self {
            destination: destination.into(),
            kind: kind.to_string(),
            source: source.into(),
            options: options.iter().map(|opt| opt.to_string()).collect(),
        }
    }

    pub fn is_bind(&self) -> bool {
        matches!(self.kind.as_str(), "bind" | "rbind")
            || self.options.iter().any(|opt| opt == "bind" || opt == "rbind")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Pid,
    Ipc,
    Uts,
    Mount,
    User,
    Cgroup,
    Network,
}

impl NamespaceKind {
    /// Name of the namespace link under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceKind::Pid => "pid",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Uts => "uts",
            NamespaceKind::Mount => "mnt",
            NamespaceKind::User => "user",
            NamespaceKind::Cgroup => "cgroup",
            NamespaceKind::Network => "net",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    /// Line for `/proc/<pid>/{uid,gid}_map`.
    pub fn map_line(&self) -> String {
        format!("{} {} {}\n", self.container_id, self.host_id, self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    pub root: PathBuf,
    pub mounts: Vec<Mount>,
    pub namespaces: Vec<NamespaceKind>,
    pub masked_paths: Vec<PathBuf>,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
}

/// Inputs of [`build_spec`].
#[derive(Debug, Clone)]
pub struct SpecOptions {
    pub rootfs: PathBuf,
    pub src_dir: PathBuf,
    pub pkg_dir: PathBuf,
    pub disable_network: bool,
    pub proc_mode: ProcMode,
    pub home_dir: PathBuf,
    pub system_cache_dir: PathBuf,
    pub socket_dir: PathBuf,
    /// Build tool executable, shadowed by `/bin/false` inside the container.
    pub exec_path: Option<PathBuf>,
}

/// Calling user's uid and primary gid.
pub fn current_ids() -> Result<(u32, u32), SandboxError> {
    let uid = getuid();
    let user = User::from_uid(uid)
        .map_err(|e| SandboxError::Identity(e.to_string()))?
        .ok_or_else(|| SandboxError::Identity(format!("no passwd entry for uid {uid}")))?;
    Ok((uid.as_raw(), user.gid.as_raw()))
}

/// `sandbox-<pid>-<unix nanos>`.
pub fn container_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("sandbox-{}-{}", std::process::id(), nanos)
}

pub fn build_spec(opts: &SpecOptions, uid: u32, gid: u32) -> Spec {
    let mut mounts = Vec::new();

    push_mount(&mut mounts, Mount::new("/dev", "tmpfs", "tmpfs", &DEV_TMPFS_OPTIONS));

    match opts.proc_mode {
        ProcMode::Isolated => {
            debug!("mounting /proc with proc filesystem");
            push_mount(&mut mounts, Mount::new("/proc", "proc", "proc", &[]));
        }
        ProcMode::HostReadOnly => {
            debug!("mounting /proc with bind mount");
            push_mount(&mut mounts, Mount::new("/proc", "bind", "/proc", &["rbind", "ro"]));
        }
    }

    for dir in SYSTEM_DIRS {
        push_mount(&mut mounts, Mount::new(dir, "rbind", dir, &["rbind", "rw"]));
    }

    let scratch: [&Path; 6] = [
        &opts.system_cache_dir,
        &opts.socket_dir,
        &opts.home_dir,
        Path::new("/var/run"),
        Path::new("/var/log"),
        Path::new("/dev/shm"),
    ];
    for dir in scratch {
        push_mount(&mut mounts, Mount::new(dir, "tmpfs", "tmpfs", &SCRATCH_TMPFS_OPTIONS));
    }

    if let Some(exec_path) = &opts.exec_path {
        push_mount(&mut mounts, Mount::new(exec_path, "bind", "/bin/false", &["ro", "rbind"]));
    }

    for dir in [&opts.src_dir, &opts.pkg_dir] {
        push_mount(
            &mut mounts,
            Mount::new(dir, "bind", dir.to_string_lossy(), &["rbind", "rw"]),
        );
    }

    let mut namespaces = vec![
        NamespaceKind::Pid,
        NamespaceKind::Ipc,
        NamespaceKind::Uts,
        NamespaceKind::Mount,
        NamespaceKind::User,
        NamespaceKind::Cgroup,
    ];
    if opts.disable_network {
        namespaces.push(NamespaceKind::Network);
    }

    Spec {
        root: opts.rootfs.clone(),
        mounts,
        namespaces,
        masked_paths: MASKED_PATHS.iter().map(PathBuf::from).collect(),
        uid_mappings: vec![IdMapping {
            container_id: 0,
            host_id: uid,
            size: 1,
        }],
        gid_mappings: vec![IdMapping {
            container_id: 0,
            host_id: gid,
            size: 1,
        }],
    }
}

/// Append `mount`, dropping any earlier mount with the same destination.
fn push_mount(mounts: &mut Vec<Mount>, mount: Mount) {
    mounts.retain(|m| m.destination != mount.destination);
    mounts.push(mount);
}
