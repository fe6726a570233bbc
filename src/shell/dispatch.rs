//! Builtin command dispatch.
//!
//! Build scripts call a few engine-provided commands (package helpers, install
//! shims) by name. [`ExecFuncs`] maps those names to in-process handlers and
//! sends everything else to a fallback exec handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{ExecError, ExecHandler, HandlerContext, HostExecHandler};

/// Kill timeout of the host handler used when no fallback is given.
pub const DEFAULT_FALLBACK_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// An in-process command. `args` excludes the command name.
#[async_trait]
pub trait Builtin: Send + Sync {
    async fn call(
        &self,
        hc: &mut HandlerContext<'_>,
        name: &str,
        args: &[String],
    ) -> Result<(), ExecError>;
}

/// Adapter for synchronous closures.
pub struct FnBuiltin<F>(F);

pub fn builtin_fn<F>(f: F) -> FnBuiltin<F>
where
    F: Fn(&HandlerContext<'_>, &str, &[String]) -> Result<(), ExecError> + Send + Sync,
{
    FnBuiltin(f)
}

#[async_trait]
impl<F> Builtin for FnBuiltin<F>
where
    F: Fn(&HandlerContext<'_>, &str, &[String]) -> Result<(), ExecError> + Send + Sync,
{
    async fn call(
        &self,
        hc: &mut HandlerContext<'_>,
        name: &str,
        args: &[String],
    ) -> Result<(), ExecError> {
        (self.0)(hc, name, args)
    }
}

/// Name → builtin table.
#[derive(Clone, Default)]
pub struct ExecFuncs {
    funcs: HashMap<String, Arc<dyn Builtin>>,
}

impl fmt::Debug for ExecFuncs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.funcs.keys().collect();
        names.sort();
        f.debug_struct("ExecFuncs").field("funcs", &names).finish()
    }
}

impl ExecFuncs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, builtin: impl Builtin + 'static) -> &mut Self {
        self.funcs.insert(name.into(), Arc::new(builtin));
        self
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, builtin: impl Builtin + 'static) -> Self {
        self.insert(name, builtin);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    /// Build the dispatching handler. Without a fallback, unknown commands run
    /// on the host with a 2s kill timeout.
    pub fn exec_handler(&self, fallback: Option<Arc<dyn ExecHandler>>) -> Dispatcher {
        let fallback = fallback
            .unwrap_or_else(|| Arc::new(HostExecHandler::new(DEFAULT_FALLBACK_KILL_TIMEOUT)));
        Dispatcher {
            funcs: self.clone(),
            fallback,
        }
    }
}

pub struct Dispatcher {
    funcs: ExecFuncs,
    fallback: Arc<dyn ExecHandler>,
}

#[async_trait]
impl ExecHandler for Dispatcher {
    async fn exec(&self, hc: &mut HandlerContext<'_>, args: &[String]) -> Result<(), ExecError> {
        if let Some((name, rest)) = args.split_first()
            && let Some(builtin) = self.funcs.funcs.get(name).cloned()
        {
            trace!(builtin = %name, "dispatching builtin");
            return builtin.call(hc, name, rest).await;
        }
        self.fallback.exec(hc, args).await
    }
}

/// Error for a builtin called with too few arguments.
pub fn insufficient_args(cmd: &str, expected: usize, got: usize) -> ExecError {
    let word = if expected == 1 { "argument" } else { "arguments" };
    ExecError::Other(anyhow::anyhow!(
        "{cmd}: command requires at least {expected} {word}, got {got}"
    ))
}

/// Accepts every command and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopExec;

#[async_trait]
impl ExecHandler for NopExec {
    async fn exec(&self, _hc: &mut HandlerContext<'_>, _args: &[String]) -> Result<(), ExecError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::Environ;
    use std::sync::Mutex;

    /// Records every argv it is asked to run.
    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ExecHandler for RecordingHandler {
        async fn exec(&self, _hc: &mut HandlerContext<'_>, args: &[String]) -> Result<(), ExecError> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(())
        }
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_builtin_receives_name_and_args() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let funcs = ExecFuncs::new().with(
            "install-file",
            builtin_fn(move |_hc, name, args| {
                *seen_clone.lock().unwrap() = Some((name.to_string(), args.to_vec()));
                Ok(())
            }),
        );

        let fallback = Arc::new(RecordingHandler::default());
        let handler = funcs.exec_handler(Some(fallback.clone() as Arc<dyn ExecHandler>));

        let env = Environ::new();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);
        handler
            .exec(&mut hc, &argv(&["install-file", "a", "b"]))
            .await
            .unwrap();

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(("install-file".to_string(), argv(&["a", "b"])))
        );
        assert!(fallback.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_goes_to_fallback() {
        let fallback = Arc::new(RecordingHandler::default());
        let handler = ExecFuncs::new().exec_handler(Some(fallback.clone() as Arc<dyn ExecHandler>));

        let env = Environ::new();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);
        handler.exec(&mut hc, &argv(&["make", "-j4"])).await.unwrap();

        assert_eq!(*fallback.calls.lock().unwrap(), vec![argv(&["make", "-j4"])]);
    }

    #[tokio::test]
    async fn test_default_fallback_runs_on_host() {
        let handler = ExecFuncs::new().exec_handler(None);

        let env: Environ = [("PATH", "/usr/bin:/bin")].into_iter().collect();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);
        let result = handler
            .exec(&mut hc, &argv(&["definitely-not-a-real-binary"]))
            .await;
        assert_eq!(result.unwrap_err().exit_code(), Some(127));
    }

    #[tokio::test]
    async fn test_builtin_errors_propagate() {
        let funcs = ExecFuncs::new().with(
            "need-two",
            builtin_fn(|_hc, name, args| {
                if args.len() < 2 {
                    return Err(insufficient_args(name, 2, args.len()));
                }
                Ok(())
            }),
        );
        let handler = funcs.exec_handler(Some(Arc::new(NopExec)));

        let env = Environ::new();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);
        let result = handler.exec(&mut hc, &argv(&["need-two", "x"])).await;
        assert_eq!(
            result.unwrap_err().to_string(),
            "need-two: command requires at least 2 arguments, got 1"
        );
    }

    #[test]
    fn test_insufficient_args_singular() {
        assert_eq!(
            insufficient_args("strip", 1, 0).to_string(),
            "strip: command requires at least 1 argument, got 0"
        );
    }

    #[tokio::test]
    async fn test_empty_args_go_to_fallback() {
        let fallback = Arc::new(RecordingHandler::default());
        let handler = ExecFuncs::new().exec_handler(Some(fallback.clone() as Arc<dyn ExecHandler>));

        let env = Environ::new();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut hc = HandlerContext::new("/", &env, &mut out, &mut err);
        handler.exec(&mut hc, &[]).await.unwrap();
        assert_eq!(fallback.calls.lock().unwrap().len(), 1);
    }
}
