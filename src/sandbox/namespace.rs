//! [`ContainerRuntime`] built on the `pkgjail-init` / `pkgjail-exec` helpers.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, warn};

use super::helper::{EXEC_ARGV0, HelperStatus, INIT_ARGV0, STATUS_FD, read_status};
use super::runtime::{Container, ContainerRuntime, ProcessSpec, RuntimeConfig};
use crate::error::SandboxError;

/// Runs containers by re-executing `helper` (normally the current binary).
#[derive(Debug, Clone)]
pub struct NamespaceRuntime {
    helper: PathBuf,
}

impl NamespaceRuntime {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }
}

impl ContainerRuntime for NamespaceRuntime {
    fn create(
        &self,
        id: &str,
        state_dir: &Path,
        config: &RuntimeConfig,
    ) -> Result<Arc<dyn Container>, SandboxError> {
        let config_path = state_dir.join("config.json");
        config
            .write_to(&config_path)
            .map_err(|e| SandboxError::Create {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        debug!(id, config = %config_path.display(), "container created");

        Ok(Arc::new(NamespaceContainer {
            id: id.to_string(),
            config_path,
            helper: self.helper.clone(),
            state: Mutex::new(ContainerState::default()),
        }))
    }
}

#[derive(Default)]
struct ContainerState {
    shim: Option<std::process::Child>,
    init_pid: Option<i32>,
}

pub struct NamespaceContainer {
    id: String,
    config_path: PathBuf,
    helper: PathBuf,
    state: Mutex<ContainerState>,
}

impl NamespaceContainer {
    fn state(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Make `fd` the child's [`STATUS_FD`].
fn attach_status_fd(cmd: &mut std::process::Command, fd: RawFd) {
    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            let rc = if fd == STATUS_FD {
                libc::fcntl(fd, libc::F_SETFD, 0)
            } else {
                libc::dup2(fd, STATUS_FD)
            };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn status_pipe() -> Result<(OwnedFd, OwnedFd), SandboxError> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| SandboxError::Io(e.into()))
}

fn caps_arg(process: &ProcessSpec) -> String {
    process.capabilities.join(",")
}

#[async_trait]
impl Container for NamespaceContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn start_init(&self, process: &ProcessSpec) -> Result<(), SandboxError> {
        let mut state = self.state();
        if state.shim.is_some() {
            return Err(SandboxError::Start(format!("container {} already started", self.id)));
        }

        let (reader, writer) = status_pipe()?;
        let mut cmd = std::process::Command::new(&self.helper);
        cmd.arg0(INIT_ARGV0)
            .arg(&self.config_path)
            .arg(caps_arg(process))
            .arg("--")
            .args(&process.args)
            .env_clear()
            .envs(process.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        attach_status_fd(&mut cmd, writer.as_raw_fd());

        let mut shim = cmd
            .spawn()
            .map_err(|e| SandboxError::Start(format!("spawn {}: {e}", self.helper.display())))?;
        drop(writer);

        let status = read_status(std::fs::File::from(reader));
        match status {
            Ok(Some(HelperStatus::Ready { pid, notes })) => {
                for note in notes {
                    debug!(id = %self.id, "{note}");
                }
                debug!(id = %self.id, pid, "init started");
                state.shim = Some(shim);
                state.init_pid = Some(pid);
                Ok(())
            }
            Ok(Some(HelperStatus::Failed { failure })) => {
                let _ = shim.wait();
                Err(SandboxError::InitSetup(failure))
            }
            Ok(Some(other)) => {
                let _ = shim.kill();
                let _ = shim.wait();
                Err(SandboxError::Protocol(format!("unexpected init status {other:?}")))
            }
            Ok(None) => {
                let exit = shim.wait()?;
                Err(SandboxError::Start(format!("init helper {exit} before reporting")))
            }
            Err(err) => {
                let _ = shim.kill();
                let _ = shim.wait();
                Err(SandboxError::Protocol(err.to_string()))
            }
        }
    }

    async fn exec(&self, process: &ProcessSpec) -> Result<tokio::process::Child, SandboxError> {
        let pid = self
            .state()
            .init_pid
            .ok_or_else(|| SandboxError::NotRunning(self.id.clone()))?;

        let (reader, writer) = status_pipe()?;
        let mut cmd = tokio::process::Command::new(&self.helper);
        cmd.arg0(EXEC_ARGV0)
            .arg(pid.to_string())
            .arg(&process.cwd)
            .arg(caps_arg(process))
            .arg("--")
            .args(&process.args)
            .env_clear()
            .envs(process.env.iter().map(|(k, v)| (k, v)))
            .stdin(if process.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        attach_status_fd(cmd.as_std_mut(), writer.as_raw_fd());

        let mut child = cmd.spawn()?;
        drop(writer);

        let file = tokio::fs::File::from_std(std::fs::File::from(reader));
        let mut line = String::new();
        let read = tokio::io::BufReader::new(file).read_line(&mut line).await?;
        if read == 0 {
            let exit = child.wait().await?;
            return Err(SandboxError::Protocol(format!(
                "exec helper {exit} before reporting"
            )));
        }

        match HelperStatus::parse(&line) {
            Ok(HelperStatus::Started { pid }) => {
                debug!(id = %self.id, pid, cmd = ?process.args, "exec started");
                Ok(child)
            }
            Ok(HelperStatus::Failed { failure }) => {
                let _ = child.wait().await;
                Err(SandboxError::ExecSetup(failure))
            }
            Ok(other) => {
                let _ = child.kill().await;
                Err(SandboxError::Protocol(format!("unexpected exec status {other:?}")))
            }
            Err(err) => {
                let _ = child.kill().await;
                Err(SandboxError::Protocol(err.to_string()))
            }
        }
    }

    fn destroy(&self) -> Result<(), SandboxError> {
        let mut state = self.state();
        state.init_pid = None;
        if let Some(mut shim) = state.shim.take() {
            // Init dies with the shim through its parent-death signal.
            let _ = shim.kill();
            shim.wait()?;
            debug!(id = %self.id, "container destroyed");
        }
        Ok(())
    }
}

impl Drop for NamespaceContainer {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!(id = %self.id, error = %err, "failed to destroy container");
        }
    }
}
