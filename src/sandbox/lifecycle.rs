//! Build-session sandboxes: one container per session, created with an
//! isolated `/proc` and retried once with a read-only bind of the host `/proc`
//! when the kernel refuses the former.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::executor::SandboxExecHandler;
use super::runtime::{Container, ContainerRuntime, ProcessSpec, RuntimeConfig};
use super::spec::{ProcMode, SpecOptions, build_spec, container_id, current_ids};
use crate::error::SandboxError;
use crate::fs::{DEFAULT_SOCKET_DIR, DEFAULT_SYSTEM_CACHE_DIR};
use crate::shell::ExecHandler;

const ROOTFS_PREFIX: &str = "pkgjail-container-rootfs-";
const STATE_PREFIX: &str = "pkgjail-container-state-";

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Grace period between SIGTERM and SIGKILL for cancelled commands.
    pub kill_timeout: Duration,
    pub src_dir: PathBuf,
    pub pkg_dir: PathBuf,
    pub disable_network: bool,
    pub home_dir: PathBuf,
    pub system_cache_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub exec_path: Option<PathBuf>,
    /// Parent of the temp dirs; the system temp dir when unset.
    pub state_root: Option<PathBuf>,
}

impl SandboxOptions {
    pub fn new(src_dir: impl Into<PathBuf>, pkg_dir: impl Into<PathBuf>) -> Self {
        let home_dir = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/root"));
        Self {
            kill_timeout: Duration::from_secs(2),
            src_dir: src_dir.into(),
            pkg_dir: pkg_dir.into(),
            disable_network: false,
            home_dir,
            system_cache_dir: PathBuf::from(DEFAULT_SYSTEM_CACHE_DIR),
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            exec_path: std::env::current_exe().ok(),
            state_root: None,
        }
    }

    fn spec_options(&self, rootfs: &Path, proc_mode: ProcMode) -> SpecOptions {
        SpecOptions {
            rootfs: rootfs.to_path_buf(),
            src_dir: self.src_dir.clone(),
            pkg_dir: self.pkg_dir.clone(),
            disable_network: self.disable_network,
            proc_mode,
            home_dir: self.home_dir.clone(),
            system_cache_dir: self.system_cache_dir.clone(),
            socket_dir: self.socket_dir.clone(),
            exec_path: self.exec_path.clone(),
        }
    }
}

/// Text match for `/proc` mount permission problems, for runtimes that only
/// report strings.
pub fn is_mount_error(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("operation not permitted")
        || text.contains("permission denied")
        || (text.contains("mount") && text.contains("proc"))
}

/// Whether a failed init start is worth retrying with [`ProcMode::HostReadOnly`].
pub fn is_retryable_start_error(err: &SandboxError) -> bool {
    match err.setup_failure() {
        Some(failure) => failure.is_mount_denial(),
        None => is_mount_error(&err.to_string()),
    }
}

/// A created container and the directories it lives in.
struct Session {
    container: Arc<dyn Container>,
    rootfs: TempDir,
    state: TempDir,
}

impl Session {
    fn close(self) {
        let id = self.container.id().to_string();
        if let Err(err) = self.container.destroy() {
            warn!(id = %id, error = %err, "failed to destroy container");
        }
        for (what, dir) in [("rootfs", self.rootfs), ("state", self.state)] {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                warn!(id = %id, path = %path.display(), error = %err, "failed to remove {what} directory");
            }
        }
    }
}

/// Result of one create-and-start attempt.
enum StartOutcome {
    Ready(Session),
    RetryableMountFailure(SandboxError),
    Fatal(SandboxError),
}

fn temp_dir(prefix: &str, root: Option<&Path>, what: &'static str) -> Result<TempDir, SandboxError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    match root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    }
    .map_err(|source| SandboxError::TempDir { what, source })
}

fn create_session(
    runtime: &dyn ContainerRuntime,
    opts: &SandboxOptions,
    proc_mode: ProcMode,
    uid: u32,
    gid: u32,
) -> Result<Session, SandboxError> {
    let rootfs = temp_dir(ROOTFS_PREFIX, opts.state_root.as_deref(), "rootfs")?;
    let state = temp_dir(STATE_PREFIX, opts.state_root.as_deref(), "state")?;

    let spec = build_spec(&opts.spec_options(rootfs.path(), proc_mode), uid, gid);
    let config = RuntimeConfig::from_spec(spec)?;
    let id = container_id();
    let container = runtime.create(&id, state.path(), &config)?;

    Ok(Session {
        container,
        rootfs,
        state,
    })
}

fn attempt(
    runtime: &dyn ContainerRuntime,
    opts: &SandboxOptions,
    proc_mode: ProcMode,
    uid: u32,
    gid: u32,
) -> StartOutcome {
    let session = match create_session(runtime, opts, proc_mode, uid, gid) {
        Ok(session) => session,
        Err(err) => return StartOutcome::Fatal(err),
    };

    match session.container.start_init(&ProcessSpec::init()) {
        Ok(()) => StartOutcome::Ready(session),
        Err(err) => {
            session.close();
            if is_retryable_start_error(&err) {
                StartOutcome::RetryableMountFailure(err)
            } else {
                StartOutcome::Fatal(err)
            }
        }
    }
}

/// Create and start the container for one build session.
pub fn create_sandbox(
    runtime: &dyn ContainerRuntime,
    opts: SandboxOptions,
) -> Result<Sandbox, SandboxError> {
    for (what, dir) in [("source", &opts.src_dir), ("package", &opts.pkg_dir)] {
        if !dir.is_absolute() || !dir.is_dir() {
            return Err(SandboxError::InvalidSpec(format!(
                "{what} directory {} must be an existing absolute path",
                dir.display()
            )));
        }
    }
    let (uid, gid) = current_ids()?;

    let mut proc_mode = ProcMode::Isolated;
    let session = loop {
        match attempt(runtime, &opts, proc_mode, uid, gid) {
            StartOutcome::Ready(session) => break session,
            StartOutcome::RetryableMountFailure(err) if proc_mode == ProcMode::Isolated => {
                warn!(error = %err, "cannot mount /proc, retrying with a read-only host /proc");
                proc_mode = ProcMode::HostReadOnly;
            }
            StartOutcome::RetryableMountFailure(err) | StartOutcome::Fatal(err) => return Err(err),
        }
    };

    let id = session.container.id().to_string();
    info!(id = %id, ?proc_mode, network = !opts.disable_network, "sandbox ready");
    let handler = Arc::new(SandboxExecHandler::new(
        session.container.clone(),
        opts.kill_timeout,
    ));

    Ok(Sandbox {
        id,
        proc_mode,
        handler,
        session: Some(session),
    })
}

/// A running build-session container. Dropping it cleans up.
pub struct Sandbox {
    id: String,
    proc_mode: ProcMode,
    handler: Arc<SandboxExecHandler>,
    session: Option<Session>,
}

impl Sandbox {
    /// The Process Executor bound to this container.
    pub fn handler(&self) -> Arc<dyn ExecHandler> {
        self.handler.clone()
    }

    pub fn proc_mode(&self) -> ProcMode {
        self.proc_mode
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Destroy the container and remove its directories. Errors are logged.
    pub fn cleanup(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(id = %self.id, "cleaning up sandbox");
            session.close();
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.cleanup();
    }
}
