use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs::{DEFAULT_SOCKET_DIR, DEFAULT_SYSTEM_CACHE_DIR, Predicate, restrict_sandbox_with};
use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Grace period between SIGTERM and SIGKILL when a command is cancelled
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// Shared package cache; hidden from the sandbox and from script fs access
    #[serde(default = "default_system_cache_dir")]
    pub system_cache_dir: String,

    /// Daemon sockets; hidden like the cache
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,

    /// Binary re-executed as the container helpers (default: this executable)
    #[serde(default)]
    pub helper: Option<String>,

    /// Parent of per-session temp dirs (default: the system temp dir)
    #[serde(default)]
    pub state_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit one JSON object per event instead of human-readable lines
    #[serde(default)]
    pub json: bool,
}

fn default_kill_timeout_ms() -> u64 {
    2_000
}
fn default_system_cache_dir() -> String {
    DEFAULT_SYSTEM_CACHE_DIR.to_string()
}
fn default_socket_dir() -> String {
    DEFAULT_SOCKET_DIR.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kill_timeout_ms: default_kill_timeout_ms(),
            system_cache_dir: default_system_cache_dir(),
            socket_dir: default_socket_dir(),
            helper: None,
            state_root: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`. A missing
    /// file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => paths.config_file(),
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Invalid config: {}", path.display()))?
        } else {
            Config::default()
        };
        config.paths = paths;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn config_path(path: Option<&Path>) -> Result<PathBuf> {
        match path {
            Some(path) => Ok(path.to_path_buf()),
            None => Ok(Paths::resolve()?.config_file()),
        }
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox.kill_timeout_ms)
    }

    pub fn system_cache_dir(&self) -> PathBuf {
        expand_path(&self.sandbox.system_cache_dir)
    }

    pub fn socket_dir(&self) -> PathBuf {
        expand_path(&self.sandbox.socket_dir)
    }

    /// Helper binary for the container runtime.
    pub fn helper_path(&self) -> Result<PathBuf> {
        match &self.sandbox.helper {
            Some(helper) => Ok(expand_path(helper)),
            None => std::env::current_exe().context("Failed to locate the running executable"),
        }
    }

    pub fn state_root(&self) -> Option<PathBuf> {
        self.sandbox.state_root.as_deref().map(expand_path)
    }

    /// Script filesystem predicate hiding the configured cache and socket
    /// directories, except for the `allowed` roots below them.
    pub fn fs_filter<P: AsRef<Path>>(&self, allowed: impl IntoIterator<Item = P>) -> Predicate {
        restrict_sandbox_with([self.system_cache_dir(), self.socket_dir()], allowed)
    }

    /// Session options for a build rooted at `src_dir` / `pkg_dir`.
    #[cfg(target_os = "linux")]
    pub fn sandbox_options(
        &self,
        src_dir: impl Into<PathBuf>,
        pkg_dir: impl Into<PathBuf>,
    ) -> crate::sandbox::SandboxOptions {
        let mut opts = crate::sandbox::SandboxOptions::new(src_dir, pkg_dir);
        opts.kill_timeout = self.kill_timeout();
        opts.system_cache_dir = self.system_cache_dir();
        opts.socket_dir = self.socket_dir();
        opts.state_root = self.state_root();
        opts
    }
}

fn expand_path(value: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(value).into_owned())
}

/// Template written by `pkgjail config init`
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# pkgjail configuration

[sandbox]
# Grace period between SIGTERM and SIGKILL for cancelled commands
kill_timeout_ms = 2000

# Hidden from sandboxed builds (only the package's own workspace below them
# stays visible)
system_cache_dir = "/var/cache/pkgjail"
socket_dir = "/run/pkgjail"

# Binary re-executed as pkgjail-init / pkgjail-exec (default: this executable)
# helper = "/usr/libexec/pkgjail"

# Parent of per-session rootfs/state temp dirs (default: system temp dir)
# state_root = "~/.cache/pkgjail"

[logging]
level = "info"
# json = false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.kill_timeout(), Duration::from_secs(2));
        assert_eq!(config.system_cache_dir(), PathBuf::from("/var/cache/pkgjail"));
        assert_eq!(config.socket_dir(), PathBuf::from("/run/pkgjail"));
        assert_eq!(config.state_root(), None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_template_parses() {
        let config = Config::from_toml(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.sandbox.kill_timeout_ms, 2000);
        assert!(config.sandbox.helper.is_none());
    }

    #[test]
    fn test_overrides_and_tilde() {
        let config = Config::from_toml(
            r#"
            [sandbox]
            kill_timeout_ms = 500
            system_cache_dir = "/srv/cache"
            state_root = "~/scratch"
            helper = "/opt/pkgjail/bin/pkgjail"

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.kill_timeout(), Duration::from_millis(500));
        assert_eq!(config.system_cache_dir(), PathBuf::from("/srv/cache"));
        assert!(config.state_root().unwrap().ends_with("scratch"));
        assert!(config.logging.json);
        assert_eq!(
            config.helper_path().unwrap(),
            PathBuf::from("/opt/pkgjail/bin/pkgjail")
        );
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.sandbox.kill_timeout_ms, 2000);
        assert!(!tmp.path().join("absent.toml").exists());
    }

    #[test]
    fn test_load_reports_bad_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[sandbox]\nkill_timeout_ms = \"soon\"\n").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid config"));
    }

    #[test]
    fn test_fs_filter_uses_configured_dirs() {
        let config = Config::from_toml("[sandbox]\nsystem_cache_dir = \"/srv/cache\"\n").unwrap();
        let filter = config.fs_filter(["/srv/cache/zlib/src"]);
        assert!(!filter(Path::new("/srv/cache/openssl")));
        assert!(filter(Path::new("/srv/cache/zlib/src/main.c")));
        assert!(filter(Path::new("/srv/cache")));
        assert!(!filter(Path::new("/run/pkgjail/daemon.sock")));
        assert!(filter(Path::new("/var/cache/pkgjail/anything")));
    }
}
