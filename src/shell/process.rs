use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncWriteExt, copy};
use tokio::process::{Child, Command};
use tracing::debug;

use super::{CancelReason, ExecError, ExecHandler, HandlerContext, exec_env, look_path_dir};

/// Shell exit status for a process killed by `signal`: 128+N, kept in 0..=255.
pub fn signal_exit_code(signal: i32) -> u8 {
    ((128 + signal) & 0xFF) as u8
}

/// Map the result of waiting on a process to the interpreter's exit status.
pub fn exit_result(status: io::Result<ExitStatus>) -> Result<(), ExecError> {
    let status = match status {
        Ok(status) => status,
        Err(err) => {
            debug!(error = %err, "waiting for process failed");
            return Err(ExecError::ExitStatus(1));
        }
    };

    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(ExecError::ExitStatus((code & 0xFF) as u8));
    }
    if let Some(signal) = status.signal() {
        return Err(ExecError::ExitStatus(signal_exit_code(signal)));
    }
    Err(ExecError::ExitStatus(1))
}

enum Completion {
    Exited(io::Result<ExitStatus>),
    Cancelled(CancelReason),
}

/// Pump a spawned child's stdio through the handler context and wait for it.
///
/// The child must have been spawned with piped stdout/stderr, and piped stdin
/// when the context has one. Completion means the process has exited and both
/// output streams are drained; the stdin copy never holds it back. On
/// cancellation the child gets SIGTERM, then SIGKILL after `kill_timeout`.
pub(crate) async fn wait_for_process(
    mut child: Child,
    hc: &mut HandlerContext<'_>,
    kill_timeout: Duration,
) -> Result<(), ExecError> {
    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();
    let cancel = hc.cancel.clone();

    let HandlerContext {
        stdin, stdout, stderr, ..
    } = hc;

    let feed_stdin = async {
        if let (Some(mut pipe), Some(reader)) = (child_stdin, stdin.as_mut()) {
            let _ = copy(reader, &mut pipe).await;
            let _ = pipe.shutdown().await;
        }
    };
    let drain_stdout = async {
        if let Some(mut pipe) = child_stdout {
            let _ = copy(&mut pipe, stdout).await;
        }
        let _ = stdout.flush().await;
    };
    let drain_stderr = async {
        if let Some(mut pipe) = child_stderr {
            let _ = copy(&mut pipe, stderr).await;
        }
        let _ = stderr.flush().await;
    };

    let outcome = {
        let exited = async {
            let (status, (), ()) = tokio::join!(child.wait(), drain_stdout, drain_stderr);
            status
        };
        let completion = async {
            tokio::pin!(exited);
            tokio::pin!(feed_stdin);
            let early = tokio::select! {
                status = &mut exited => Some(status),
                () = &mut feed_stdin => None,
            };
            match early {
                Some(status) => status,
                None => exited.await,
            }
        };

        tokio::select! {
            status = completion => Completion::Exited(status),
            reason = cancel.cancelled() => Completion::Cancelled(reason),
        }
    };

    match outcome {
        Completion::Exited(status) => exit_result(status),
        Completion::Cancelled(reason) => {
            terminate(&mut child, kill_timeout).await;
            Err(ExecError::Cancelled(reason))
        }
    }
}

async fn terminate(child: &mut Child, kill_timeout: Duration) {
    if let Some(pid) = child.id() {
        debug!(pid, "cancelled, sending SIGTERM");
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if tokio::time::timeout(kill_timeout, child.wait()).await.is_err() {
        debug!("process ignored SIGTERM, killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Runs commands directly on the host, resolving them against the
/// interpreter's `$PATH` and working directory.
#[derive(Debug, Clone)]
pub struct HostExecHandler {
    kill_timeout: Duration,
}

impl HostExecHandler {
    pub fn new(kill_timeout: Duration) -> Self {
        Self { kill_timeout }
    }
}

#[async_trait]
impl ExecHandler for HostExecHandler {
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

        let mut cmd = Command::new(&path);
        cmd.as_std_mut().arg0(name);
        cmd.args(rest)
            .current_dir(&hc.dir)
            .env_clear()
            .envs(exec_env(hc.env))
            .stdin(if hc.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                hc.report(format!("run failed: {err}")).await;
                return Err(ExecError::ExitStatus(1));
            }
        };
        debug!(command = %path.display(), pid = child.id(), "spawned host command");

        wait_for_process(child, hc, self.kill_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{CancelToken, Environ};
    use std::time::Instant;

    fn host_env() -> Environ {
        [("PATH", "/usr/bin:/bin")].into_iter().collect()
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exit_result_mapping() {
        assert!(exit_result(Ok(ExitStatus::from_raw(0))).is_ok());
        assert_eq!(
            exit_result(Ok(ExitStatus::from_raw(3 << 8))).unwrap_err().exit_code(),
            Some(3)
        );
        // Killed by SIGKILL.
        assert_eq!(
            exit_result(Ok(ExitStatus::from_raw(9))).unwrap_err().exit_code(),
            Some(137)
        );
        assert_eq!(
            exit_result(Err(io::Error::other("wait"))).unwrap_err().exit_code(),
            Some(1)
        );
    }

    #[test]
    fn test_signal_exit_code_wraps() {
        assert_eq!(signal_exit_code(15), 143);
        assert_eq!(signal_exit_code(200), 72);
    }

    #[tokio::test]
    async fn test_host_exec_echo() {
        let env = host_env();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);

        let handler = HostExecHandler::new(Duration::from_secs(2));
        handler.exec(&mut hc, &argv(&["echo", "hello"])).await.unwrap();
        drop(hc);
        assert_eq!(out, b"hello\n");
    }

    #[tokio::test]
    async fn test_host_exec_exit_code() {
        let env = host_env();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);

        let handler = HostExecHandler::new(Duration::from_secs(2));
        let result = handler.exec(&mut hc, &argv(&["sh", "-c", "exit 7"])).await;
        assert_eq!(result.unwrap_err().exit_code(), Some(7));
    }

    #[tokio::test]
    async fn test_host_exec_missing_binary() {
        let env = host_env();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);

        let handler = HostExecHandler::new(Duration::from_secs(2));
        let result = handler
            .exec(&mut hc, &argv(&["definitely-not-a-real-binary"]))
            .await;
        drop(hc);
        assert_eq!(result.unwrap_err().exit_code(), Some(127));
        assert!(String::from_utf8_lossy(&err).contains("executable file not found"));
    }

    #[tokio::test]
    async fn test_host_exec_empty_args() {
        let env = host_env();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);

        let result = HostExecHandler::new(Duration::from_secs(2))
            .exec(&mut hc, &[])
            .await;
        drop(hc);
        assert_eq!(result.unwrap_err().exit_code(), Some(127));
        assert_eq!(err, b"no command provided\n");
    }

    #[tokio::test]
    async fn test_host_exec_stdin_is_forwarded() {
        let env = host_env();
        let mut input: &[u8] = b"from stdin\n";
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err).with_stdin(&mut input);

        HostExecHandler::new(Duration::from_secs(2))
            .exec(&mut hc, &argv(&["cat"]))
            .await
            .unwrap();
        drop(hc);
        assert_eq!(out, b"from stdin\n");
    }

    #[tokio::test]
    async fn test_host_exec_cancel_terminates() {
        let env = host_env();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let cancel = CancelToken::new();
        let mut hc =
            HandlerContext::new("/", &env, &mut out, &mut err).with_cancel(cancel.clone());

        cancel.cancel_after(Duration::from_millis(100));
        let started = Instant::now();
        let result = HostExecHandler::new(Duration::from_secs(2))
            .exec(&mut hc, &argv(&["sleep", "30"]))
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
