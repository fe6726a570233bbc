//! Error types for sandbox setup.
//!
//! `SandboxError` covers everything that aborts a build session. Failures that
//! happen inside the helper processes (namespace creation, mounts, setns) are
//! reported across the status pipe as a serialized `SetupFailure`, so the parent
//! can classify them by stage and errno instead of re-parsing text.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Step of container setup or command entry that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupStage {
    Config,
    Namespace,
    IdMap,
    Mount,
    Device,
    PivotRoot,
    Mask,
    Capabilities,
    Join,
    Exec,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Config => "config",
            SetupStage::Namespace => "namespace",
            SetupStage::IdMap => "id-map",
            SetupStage::Mount => "mount",
            SetupStage::Device => "device",
            SetupStage::PivotRoot => "pivot-root",
            SetupStage::Mask => "mask",
            SetupStage::Capabilities => "capabilities",
            SetupStage::Join => "join",
            SetupStage::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Typed failure reported by a helper process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupFailure {
    pub stage: SetupStage,
    /// Path or namespace the stage was operating on.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub errno: Option<i32>,
    pub message: String,
}

impl SetupFailure {
    pub fn new(stage: SetupStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            target: None,
            errno: None,
            message: message.into(),
        }
    }

    pub fn with_target(mut self, target: impl fmt::Display) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn from_io(stage: SetupStage, err: &io::Error) -> Self {
        Self {
            stage,
            target: None,
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    #[cfg(unix)]
    pub fn from_errno(stage: SetupStage, errno: nix::errno::Errno) -> Self {
        Self {
            stage,
            target: None,
            errno: Some(errno as i32),
            message: errno.to_string(),
        }
    }

    /// True when a mount was refused for lack of privilege, or any mount of
    /// `/proc` failed. These are the failures a host-bound `/proc` can avoid.
    pub fn is_mount_denial(&self) -> bool {
        if self.stage != SetupStage::Mount {
            return false;
        }
        let denied = matches!(self.errno, Some(libc::EPERM) | Some(libc::EACCES));
        denied || self.target.as_deref() == Some("/proc")
    }
}

impl fmt::Display for SetupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} {}: {}", self.stage, target, self.message),
            None => write!(f, "{}: {}", self.stage, self.message),
        }
    }
}

impl std::error::Error for SetupFailure {}

/// Errors that abort a sandbox session.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create {what} directory: {source}")]
    TempDir {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve the calling user: {0}")]
    Identity(String),

    #[error("invalid container spec: {0}")]
    InvalidSpec(String),

    #[error("failed to create container {id}: {reason}")]
    Create { id: String, reason: String },

    /// Init process failed inside a helper, with a typed cause.
    #[error("failed to start init process: {0}")]
    InitSetup(#[source] SetupFailure),

    /// Init process failed without a typed cause (runtime-provided text only).
    #[error("failed to start init process: {0}")]
    Start(String),

    #[error("failed to enter container: {0}")]
    ExecSetup(#[source] SetupFailure),

    #[error("container {0} is not running")]
    NotRunning(String),

    #[error("helper protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    /// The helper-reported failure behind this error, if any.
    pub fn setup_failure(&self) -> Option<&SetupFailure> {
        match self {
            SandboxError::InitSetup(failure) | SandboxError::ExecSetup(failure) => Some(failure),
            _ => None,
        }
    }
}
