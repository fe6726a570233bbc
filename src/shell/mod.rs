//! Contracts between a host script interpreter and the execution engine.
//!
//! The interpreter owns variables, the working directory and the stdio streams.
//! It hands them to an [`ExecHandler`] through a [`HandlerContext`] for every
//! external command, and receives an [`ExecError`] describing how the command
//! ended: an exit status its own `if`/`&&`/`set -e` logic can act on, or the
//! cancellation reason when the build was aborted.

mod cancel;
pub mod dispatch;
mod lookpath;
mod process;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub use cancel::{CancelReason, CancelToken};
pub use dispatch::{Builtin, Dispatcher, ExecFuncs, NopExec, builtin_fn, insufficient_args};
pub use lookpath::{LookPathError, look_path_dir};
pub use process::{HostExecHandler, exit_result, signal_exit_code};
pub(crate) use process::wait_for_process;

/// Kind of a shell variable. Only plain strings are passed to child processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarKind {
    #[default]
    String,
    Indexed,
    Associative,
    NameRef,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub value: String,
    pub exported: bool,
    pub kind: VarKind,
    /// False when the interpreter has `unset` the name.
    pub set: bool,
}

impl Variable {
    pub fn exported(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            exported: true,
            kind: VarKind::String,
            set: true,
        }
    }

    pub fn local(value: impl Into<String>) -> Self {
        Self {
            exported: false,
            ..Self::exported(value)
        }
    }

    pub fn unset() -> Self {
        Self {
            set: false,
            ..Self::exported(String::new())
        }
    }
}

/// The interpreter's variable table as seen by exec handlers.
#[derive(Debug, Clone, Default)]
pub struct Environ {
    vars: BTreeMap<String, Variable>,
}

impl Environ {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exported string variables from the current process environment.
    pub fn from_host() -> Self {
        std::env::vars().collect()
    }

    pub fn set(&mut self, name: impl Into<String>, var: Variable) -> &mut Self {
        self.vars.insert(name.into(), var);
        self
    }

    pub fn export(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set(name, Variable::exported(value))
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name).filter(|var| var.set)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variable)> {
        self.vars.iter().map(|(name, var)| (name.as_str(), var))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environ {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Environ::new();
        for (name, value) in iter {
            env.export(name, value);
        }
        env
    }
}

/// Environment for a child process: exported, set, string-kind variables only.
/// Shell-internal variables never leak into spawned processes.
pub fn exec_env(env: &Environ) -> Vec<(String, String)> {
    env.iter()
        .filter(|(_, var)| var.set && var.exported && var.kind == VarKind::String)
        .map(|(name, var)| (name.to_string(), var.value.clone()))
        .collect()
}

/// Per-command view of the interpreter state.
pub struct HandlerContext<'a> {
    pub dir: PathBuf,
    pub env: &'a Environ,
    pub stdin: Option<&'a mut (dyn AsyncRead + Unpin + Send)>,
    pub stdout: &'a mut (dyn AsyncWrite + Unpin + Send),
    pub stderr: &'a mut (dyn AsyncWrite + Unpin + Send),
    pub cancel: CancelToken,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        dir: impl Into<PathBuf>,
        env: &'a Environ,
        stdout: &'a mut (dyn AsyncWrite + Unpin + Send),
        stderr: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> Self {
        Self {
            dir: dir.into(),
            env,
            stdin: None,
            stdout,
            stderr,
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: &'a mut (dyn AsyncRead + Unpin + Send)) -> Self {
        self.stdin = Some(stdin);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one diagnostic line to the command's stderr. Write errors are ignored.
    pub async fn report(&mut self, msg: impl Display) {
        let line = format!("{msg}\n");
        let _ = self.stderr.write_all(line.as_bytes()).await;
        let _ = self.stderr.flush().await;
    }
}

/// How an external command ended, when it did not simply succeed.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Non-zero shell exit status (1..=255).
    #[error("exit status {0}")]
    ExitStatus(u8),

    /// The command was terminated because the caller cancelled it.
    #[error("{0}")]
    Cancelled(CancelReason),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecError {
    /// The shell exit status this error stands for, if it is one.
    pub fn exit_code(&self) -> Option<u8> {
        match self {
            ExecError::ExitStatus(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled(_))
    }
}

/// Runs one external command on behalf of the interpreter.
#[async_trait]
pub trait ExecHandler: Send + Sync {
    async fn exec(&self, hc: &mut HandlerContext<'_>, args: &[String]) -> Result<(), ExecError>;
}
