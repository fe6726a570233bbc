use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::capabilities::default_capabilities;
use super::runtime::{Container, ProcessSpec};
use crate::shell::{
    ExecError, ExecHandler, HandlerContext, exec_env, look_path_dir, wait_for_process,
};

/// Runs interpreter commands inside a running container.
///
/// Commands are resolved against the interpreter's `$PATH` on the host side;
/// the sandbox bind-mounts the same system directories, so the resolved path
/// is valid inside as well.
pub struct SandboxExecHandler {
    container: Arc<dyn Container>,
    kill_timeout: Duration,
}

impl SandboxExecHandler {
    pub fn new(container: Arc<dyn Container>, kill_timeout: Duration) -> Self {
        Self {
            container,
            kill_timeout,
        }
    }
}

#[async_trait]
impl ExecHandler for SandboxExecHandler {
    async fn exec(&self, hc: &mut HandlerContext<'_>, args: &[String]) -> Result<(), ExecError> {
        let Some((name, rest)) = args.split_first() else {
            hc.report("no command provided").await;
            return Err(ExecError::ExitStatus(127));
        };

        let path = match look_path_dir(&hc.dir, hc.env, name) {
            Ok(path) => path,
            Err(err) => {
                hc.report(err).await;
                return Err(ExecError::ExitStatus(127));
            }
        };

        let mut argv = Vec::with_capacity(args.len());
        argv.push(path.to_string_lossy().into_owned());
        argv.extend(rest.iter().cloned());

        let process = ProcessSpec {
            args: argv,
            env: exec_env(hc.env),
            cwd: hc.dir.clone(),
            capabilities: default_capabilities(),
            stdin: hc.stdin.is_some(),
        };

        let child = match self.container.exec(&process).await {
            Ok(child) => child,
            Err(err) => {
                hc.report(format!("run failed: {err}")).await;
                return Err(ExecError::ExitStatus(1));
            }
        };
        debug!(
            container = self.container.id(),
            command = %path.display(),
            "spawned sandboxed command"
        );

        wait_for_process(child, hc, self.kill_timeout).await
    }
}
