use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::Config;
use crate::sandbox::{NamespaceRuntime, ProcMode, Sandbox, create_sandbox};
use crate::shell::{
    Builtin, CancelToken, Environ, ExecError, ExecFuncs, ExecHandler, HandlerContext,
};

#[derive(Args)]
pub struct RunArgs {
    /// Source directory, writable inside the sandbox
    #[arg(long)]
    pub src: PathBuf,

    /// Package staging directory, writable inside the sandbox
    #[arg(long)]
    pub pkg: PathBuf,

    /// Run without network access
    #[arg(long)]
    pub disable_network: bool,

    /// Working directory of the command (default: --src)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Forward stdin to the command
    #[arg(short, long)]
    pub interactive: bool,

    /// Command and arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Prints the session's container id and `/proc` mode.
struct SandboxInfo {
    id: String,
    proc_mode: ProcMode,
}

#[async_trait]
impl Builtin for SandboxInfo {
    async fn call(
        &self,
        hc: &mut HandlerContext<'_>,
        _name: &str,
        _args: &[String],
    ) -> Result<(), ExecError> {
        let proc_mode = match self.proc_mode {
            ProcMode::Isolated => "isolated",
            ProcMode::HostReadOnly => "host-read-only",
        };
        let line = format!("{} proc={}\n", self.id, proc_mode);
        hc.stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ExecError::Other(e.into()))
    }
}

fn absolute_dir(path: &Path, what: &str) -> Result<PathBuf> {
    std::fs::canonicalize(path)
        .with_context(|| format!("{what} directory {} is not accessible", path.display()))
}

/// Create a session container from the configuration. Blocks until init runs.
pub async fn open_sandbox(
    config: &Config,
    src: &Path,
    pkg: &Path,
    disable_network: bool,
) -> Result<Sandbox> {
    let runtime = NamespaceRuntime::new(config.helper_path()?);
    let mut opts = config.sandbox_options(src, pkg);
    opts.disable_network = disable_network;

    let sandbox = tokio::task::spawn_blocking(move || create_sandbox(&runtime, opts))
        .await
        .context("sandbox setup panicked")??;
    Ok(sandbox)
}

/// Exit status of the command, shell style.
pub async fn run(args: RunArgs, config: &Config) -> Result<i32> {
    let src = absolute_dir(&args.src, "source")?;
    let pkg = absolute_dir(&args.pkg, "package")?;
    let cwd = args.cwd.clone().unwrap_or_else(|| src.clone());

    let mut sandbox = open_sandbox(config, &src, &pkg, args.disable_network).await?;
    debug!(id = sandbox.id(), "running {:?}", args.command);

    let handler = ExecFuncs::new()
        .with(
            "pkgjail-info",
            SandboxInfo {
                id: sandbox.id().to_string(),
                proc_mode: sandbox.proc_mode(),
            },
        )
        .exec_handler(Some(sandbox.handler()));

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = run_command(&handler, &cwd, &args.command, args.interactive, cancel).await;
    interrupt.abort();
    sandbox.cleanup();

    Ok(match result {
        Ok(()) => 0,
        Err(ExecError::ExitStatus(code)) => i32::from(code),
        Err(ExecError::Cancelled(reason)) => {
            eprintln!("pkgjail: {reason}");
            130
        }
        Err(ExecError::Other(err)) => {
            eprintln!("pkgjail: {err:#}");
            1
        }
    })
}

async fn run_command(
    handler: &dyn ExecHandler,
    cwd: &Path,
    command: &[String],
    interactive: bool,
    cancel: CancelToken,
) -> Result<(), ExecError> {
    let env = Environ::from_host();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut stdin = tokio::io::stdin();

    let mut hc = HandlerContext::new(cwd, &env, &mut stdout, &mut stderr).with_cancel(cancel);
    if interactive {
        hc = hc.with_stdin(&mut stdin);
    }
    handler.exec(&mut hc, command).await
}
