use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::run::open_sandbox;
use crate::config::Config;
use crate::sandbox::detect_capabilities;
use crate::shell::{CancelToken, Environ, ExecError, ExecHandler, HandlerContext};

struct Output {
    result: Result<(), ExecError>,
    stdout: String,
    stderr: String,
}

impl Output {
    fn code(&self) -> Option<u8> {
        match &self.result {
            Ok(()) => Some(0),
            Err(err) => err.exit_code(),
        }
    }
}

async fn exec(
    handler: &dyn ExecHandler,
    cwd: &Path,
    env: &Environ,
    args: &[&str],
    cancel: CancelToken,
) -> Output {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut hc = HandlerContext::new(cwd, env, &mut stdout, &mut stderr).with_cancel(cancel);
    let result = handler.exec(&mut hc, &args).await;
    drop(hc);
    Output {
        result,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

fn report(passed: &mut usize, failed: &mut usize, outcome: Result<String, String>) {
    match outcome {
        Ok(msg) => {
            println!("{}", msg);
            *passed += 1;
        }
        Err(msg) => {
            println!("FAIL ({})", msg);
            *failed += 1;
        }
    }
}

fn describe(output: &Output) -> String {
    let stderr: String = output.stderr.trim().chars().take(100).collect();
    format!("exit={:?}, stderr={}", output.code(), stderr)
}

pub async fn run(config: &Config) -> Result<()> {
    let caps = detect_capabilities();
    if !caps.user_namespaces() {
        println!("Unprivileged user namespaces are not available on this host.");
        println!("Skipping sandbox tests.");
        return Ok(());
    }

    let workspace = tempfile::Builder::new().prefix("pkgjail-selftest-").tempdir()?;
    let src = workspace.path().join("src");
    let pkg = workspace.path().join("pkg");
    std::fs::create_dir_all(&src)?;
    std::fs::create_dir_all(&pkg)?;

    let mut sandbox = open_sandbox(config, &src, &pkg, true).await?;
    let handler = sandbox.handler();
    let env: Environ = [("PATH", "/usr/local/bin:/usr/bin:/bin")].into_iter().collect();

    println!("Running sandbox smoke tests...");
    println!("  Container: {}", sandbox.id());
    println!("  /proc:     {:?}", sandbox.proc_mode());
    println!();

    let mut passed = 0;
    let mut failed = 0;

    print!("  [1/6] Echo command succeeds:        ");
    let out = exec(handler.as_ref(), &src, &env, &["echo", "hello"], CancelToken::new()).await;
    report(
        &mut passed,
        &mut failed,
        if out.code() == Some(0) && out.stdout.trim() == "hello" {
            Ok("ok".into())
        } else {
            Err(describe(&out))
        },
    );

    print!("  [2/6] Write in workspace:           ");
    let target = pkg.join("staged");
    let script = format!("echo staged > {}", target.display());
    let out = exec(handler.as_ref(), &src, &env, &["sh", "-c", &script], CancelToken::new()).await;
    report(
        &mut passed,
        &mut failed,
        match std::fs::read_to_string(&target) {
            Ok(content) if content.trim() == "staged" => Ok("visible on host (ok)".into()),
            _ => Err(describe(&out)),
        },
    );

    print!("  [3/6] Write to $HOME is ephemeral:  ");
    let home = config.sandbox_options(&src, &pkg).home_dir;
    let marker = home.join(format!(".pkgjail-selftest-{}", std::process::id()));
    let script = format!("echo x > {} && cat {}", marker.display(), marker.display());
    let out = exec(handler.as_ref(), &src, &env, &["sh", "-c", &script], CancelToken::new()).await;
    report(
        &mut passed,
        &mut failed,
        if out.code() == Some(0) && !marker.exists() {
            Ok("hidden from host (ok)".into())
        } else if marker.exists() {
            let _ = std::fs::remove_file(&marker);
            Err("file leaked to host".into())
        } else {
            Err(describe(&out))
        },
    );

    print!("  [4/6] Network isolated:             ");
    let out = exec(
        handler.as_ref(),
        &src,
        &env,
        &["cat", "/proc/net/dev"],
        CancelToken::new(),
    )
    .await;
    let interfaces: Vec<&str> = out
        .stdout
        .lines()
        .filter_map(|line| line.split_once(':').map(|(name, _)| name.trim()))
        .collect();
    report(
        &mut passed,
        &mut failed,
        if out.code() == Some(0) && interfaces.iter().all(|name| *name == "lo") {
            Ok("loopback only (ok)".into())
        } else {
            Err(format!("interfaces={:?}, {}", interfaces, describe(&out)))
        },
    );

    print!("  [5/6] Missing command is 127:       ");
    let out = exec(
        handler.as_ref(),
        &src,
        &env,
        &["pkgjail-no-such-command"],
        CancelToken::new(),
    )
    .await;
    report(
        &mut passed,
        &mut failed,
        if out.code() == Some(127) {
            Ok("ok".into())
        } else {
            Err(describe(&out))
        },
    );

    print!("  [6/6] Cancellation:                 ");
    let cancel = CancelToken::new();
    cancel.cancel_after(Duration::from_millis(300));
    let start = Instant::now();
    let out = exec(handler.as_ref(), &src, &env, &["sleep", "30"], cancel).await;
    let elapsed = start.elapsed();
    report(
        &mut passed,
        &mut failed,
        match &out.result {
            Err(err) if err.is_cancelled() && elapsed < Duration::from_secs(10) => {
                Ok(format!("stopped after {:.1}s (ok)", elapsed.as_secs_f64()))
            }
            _ => Err(describe(&out)),
        },
    );

    sandbox.cleanup();

    println!();
    if failed == 0 {
        println!("All {} tests passed.", passed);
        Ok(())
    } else {
        anyhow::bail!("{} passed, {} failed.", passed, failed)
    }
}
