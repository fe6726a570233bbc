use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Environ;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("\"{name}\": executable file not found in $PATH")]
pub struct LookPathError {
    pub name: String,
}

/// Resolve `file` the way a shell does, relative to the interpreter's `cwd`
/// rather than the process working directory.
///
/// Names containing a slash are resolved against `cwd` directly. Otherwise each
/// `$PATH` entry is tried in order; empty and relative entries are relative to
/// `cwd`.
pub fn look_path_dir(cwd: &Path, env: &Environ, file: &str) -> Result<PathBuf, LookPathError> {
    let not_found = || LookPathError {
        name: file.to_string(),
    };

    if file.is_empty() {
        return Err(not_found());
    }

    if file.contains('/') {
        let candidate = cwd.join(file);
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(not_found())
        };
    }

    let path_var = env.get("PATH").map(|var| var.value.as_str()).unwrap_or("");
    for entry in path_var.split(':') {
        let dir = if entry.is_empty() {
            cwd.to_path_buf()
        } else {
            cwd.join(entry)
        };
        let candidate = dir.join(file);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    Err(not_found())
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_exec(path: &Path, mode: u32) {
        fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_relative_path_entry_uses_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("tools")).unwrap();
        write_exec(&tmp.path().join("tools/hello"), 0o755);

        let env: Environ = [("PATH", "tools")].into_iter().collect();
        let found = look_path_dir(tmp.path(), &env, "hello").unwrap();
        assert_eq!(found, tmp.path().join("tools/hello"));
    }

    #[test]
    fn test_empty_entry_means_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        write_exec(&tmp.path().join("build.sh"), 0o755);

        let env: Environ = [("PATH", "/nonexistent:")].into_iter().collect();
        let found = look_path_dir(tmp.path(), &env, "build.sh").unwrap();
        assert_eq!(found, tmp.path().join("build.sh"));
    }

    #[test]
    fn test_slash_names_skip_path() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("bin")).unwrap();
        write_exec(&tmp.path().join("bin/run"), 0o700);

        let env = Environ::new();
        let found = look_path_dir(tmp.path(), &env, "./bin/run").unwrap();
        assert_eq!(found, tmp.path().join("./bin/run"));
    }

    #[test]
    fn test_non_executable_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        write_exec(&tmp.path().join("data"), 0o644);

        let env: Environ = [("PATH", tmp.path().to_str().unwrap())].into_iter().collect();
        let err = look_path_dir(tmp.path(), &env, "data").unwrap_err();
        assert_eq!(
            err.to_string(),
            "\"data\": executable file not found in $PATH"
        );
    }

    #[test]
    fn test_directories_are_not_executables() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();

        let env: Environ = [("PATH", tmp.path().to_str().unwrap())].into_iter().collect();
        assert!(look_path_dir(tmp.path(), &env, "sub").is_err());
    }
}
