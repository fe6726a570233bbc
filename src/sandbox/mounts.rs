//! Root filesystem assembly, run by the init helper inside the new mount
//! namespace before it execs the init process.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::statvfs::{FsFlags, statvfs};
use nix::unistd::{chdir, pivot_root};

use super::runtime::DeviceRule;
use super::spec::Mount;
use crate::error::{SetupFailure, SetupStage};

const MAX_SYMLINK_DEPTH: usize = 255;

/// Parsed `options` of a [`Mount`].
#[derive(Debug, PartialEq, Eq)]
pub struct MountOptions {
    pub flags: MsFlags,
    pub propagation: Vec<MsFlags>,
    pub data: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            flags: MsFlags::empty(),
            propagation: Vec::new(),
            data: Vec::new(),
        }
    }
}

impl MountOptions {
    pub fn parse<S: AsRef<str>>(options: &[S]) -> Self {
        let mut parsed = MountOptions::default();
        for option in options {
            let option = option.as_ref();
            if let Some((set, flag)) = flag_option(option) {
                if set {
                    parsed.flags.insert(flag);
                } else {
                    parsed.flags.remove(flag);
                }
            } else if let Some(propagation) = propagation_option(option) {
                parsed.propagation.push(propagation);
            } else if option != "defaults" {
                parsed.data.push(option.to_string());
            }
        }
        parsed
    }

    fn data(&self) -> Option<String> {
        if self.data.is_empty() {
            None
        } else {
            Some(self.data.join(","))
        }
    }

    /// Flags a bind mount only gets through a second, remounting call.
    fn remount_flags(&self) -> MsFlags {
        self.flags
            & (MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_NOATIME
                | MsFlags::MS_NODIRATIME
                | MsFlags::MS_RELATIME
                | MsFlags::MS_STRICTATIME)
    }
}

/// `(set, flag)` for options that map to mount flags.
fn flag_option(option: &str) -> Option<(bool, MsFlags)> {
    let flag = match option {
        "async" => (false, MsFlags::MS_SYNCHRONOUS),
        "atime" => (false, MsFlags::MS_NOATIME),
        "bind" => (true, MsFlags::MS_BIND),
        "dev" => (false, MsFlags::MS_NODEV),
        "diratime" => (false, MsFlags::MS_NODIRATIME),
        "dirsync" => (true, MsFlags::MS_DIRSYNC),
        "exec" => (false, MsFlags::MS_NOEXEC),
        "mand" => (true, MsFlags::MS_MANDLOCK),
        "noatime" => (true, MsFlags::MS_NOATIME),
        "nodev" => (true, MsFlags::MS_NODEV),
        "nodiratime" => (true, MsFlags::MS_NODIRATIME),
        "noexec" => (true, MsFlags::MS_NOEXEC),
        "nosuid" => (true, MsFlags::MS_NOSUID),
        "rbind" => (true, MsFlags::MS_BIND | MsFlags::MS_REC),
        "relatime" => (true, MsFlags::MS_RELATIME),
        "ro" => (true, MsFlags::MS_RDONLY),
        "rw" => (false, MsFlags::MS_RDONLY),
        "strictatime" => (true, MsFlags::MS_STRICTATIME),
        "suid" => (false, MsFlags::MS_NOSUID),
        "sync" => (true, MsFlags::MS_SYNCHRONOUS),
        _ => return None,
    };
    Some(flag)
}

fn propagation_option(option: &str) -> Option<MsFlags> {
    let flags = match option {
        "private" => MsFlags::MS_PRIVATE,
        "rprivate" => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        "shared" => MsFlags::MS_SHARED,
        "rshared" => MsFlags::MS_SHARED | MsFlags::MS_REC,
        "slave" => MsFlags::MS_SLAVE,
        "rslave" => MsFlags::MS_SLAVE | MsFlags::MS_REC,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        "runbindable" => MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
        _ => return None,
    };
    Some(flags)
}

fn pending_components(path: &Path) -> VecDeque<OsString> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect()
}

/// Resolve `unsafe_path` inside `root` as if `root` were `/`.
///
/// Symlinks are followed with absolute targets re-rooted at `root`, and `..`
/// never climbs above it. Missing components are kept as-is.
pub fn secure_join(root: &Path, unsafe_path: &Path) -> io::Result<PathBuf> {
    let mut pending = pending_components(unsafe_path);
    let mut current = PathBuf::new();
    let mut depth = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            current.pop();
            continue;
        }

        let candidate = current.join(&part);
        let full = root.join(&candidate);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                depth += 1;
                if depth > MAX_SYMLINK_DEPTH {
                    return Err(io::Error::from_raw_os_error(libc::ELOOP));
                }
                let target = fs::read_link(&full)?;
                if target.is_absolute() {
                    current = PathBuf::new();
                }
                let mut expanded = pending_components(&target);
                while let Some(part) = expanded.pop_back() {
                    pending.push_front(part);
                }
            }
            _ => current = candidate,
        }
    }

    Ok(root.join(current))
}

fn mount_failure(target: &Path, errno: Errno) -> SetupFailure {
    SetupFailure::from_errno(SetupStage::Mount, errno).with_target(target.display())
}

fn io_failure(stage: SetupStage, target: &Path, err: &io::Error) -> SetupFailure {
    SetupFailure::from_io(stage, err).with_target(target.display())
}

/// Flags the kernel refuses to clear on a remount from inside a user namespace.
fn locked_flags(path: &Path) -> MsFlags {
    let Ok(stat) = statvfs(path) else {
        return MsFlags::empty();
    };
    let flags = stat.flags();
    let mut locked = MsFlags::empty();
    for (fs_flag, ms_flag) in [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if flags.contains(fs_flag) {
            locked.insert(ms_flag);
        }
    }
    locked
}

fn create_mount_point(dest: &Path, dir: bool) -> io::Result<()> {
    if dir {
        return fs::create_dir_all(dest);
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::OpenOptions::new().create(true).append(true).open(dest) {
        Ok(_) => Ok(()),
        Err(_) if dest.exists() => Ok(()),
        Err(err) => Err(err),
    }
}

/// What happened to one mount entry.
#[derive(Debug, PartialEq, Eq)]
pub enum MountResult {
    Mounted,
    /// Nothing to mount or nothing to cover; the reason is reported upstream.
    Skipped(String),
}

/// Mount one entry below `rootfs`.
pub fn mount_entry(rootfs: &Path, entry: &Mount) -> Result<MountResult, SetupFailure> {
    let dest = secure_join(rootfs, &entry.destination)
        .map_err(|e| io_failure(SetupStage::Mount, &entry.destination, &e))?;
    let options = MountOptions::parse(&entry.options);

    if entry.is_bind() {
        let source = Path::new(&entry.source);
        let meta = match fs::metadata(source) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(MountResult::Skipped(format!(
                    "bind source {} does not exist",
                    source.display()
                )));
            }
            Err(err) => return Err(io_failure(SetupStage::Mount, &entry.destination, &err)),
        };
        create_mount_point(&dest, meta.is_dir())
            .map_err(|e| io_failure(SetupStage::Mount, &entry.destination, &e))?;

        let bind = MsFlags::MS_BIND | (options.flags & MsFlags::MS_REC);
        mount(Some(source), &dest, None::<&str>, bind, None::<&str>)
            .map_err(|e| mount_failure(&entry.destination, e))?;

        let extra = options.remount_flags();
        if !extra.is_empty() {
            let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | extra | locked_flags(&dest);
            mount(None::<&str>, &dest, None::<&str>, flags, None::<&str>)
                .map_err(|e| mount_failure(&entry.destination, e))?;
        }
    } else {
        if let Err(err) = fs::create_dir_all(&dest) {
            // A scratch tmpfs only hides what is there; a path that cannot
            // even be created has nothing to hide.
            if entry.kind == "tmpfs" && !dest.exists() {
                return Ok(MountResult::Skipped(format!(
                    "cannot create {}: {err}",
                    entry.destination.display()
                )));
            }
            return Err(io_failure(SetupStage::Mount, &entry.destination, &err));
        }
        let data = options.data();
        mount(
            Some(entry.source.as_str()),
            &dest,
            Some(entry.kind.as_str()),
            options.flags,
            data.as_deref(),
        )
        .map_err(|e| mount_failure(&entry.destination, e))?;
    }

    for propagation in &options.propagation {
        mount(None::<&str>, &dest, None::<&str>, *propagation, None::<&str>)
            .map_err(|e| mount_failure(&entry.destination, e))?;
    }

    Ok(MountResult::Mounted)
}

/// Make the host mounts private to this namespace and turn `rootfs` into a
/// mount point so it can be pivoted into.
pub fn prepare_rootfs(rootfs: &Path) -> Result<(), SetupFailure> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| mount_failure(Path::new("/"), e))?;

    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_failure(rootfs, e))
}

/// Bind host device nodes into the container's `/dev`.
pub fn bind_devices(rootfs: &Path, devices: &[DeviceRule]) -> Result<Vec<String>, SetupFailure> {
    let mut skipped = Vec::new();
    for device in devices {
        if !device.path.exists() {
            skipped.push(format!("host device {} is missing", device.path.display()));
            continue;
        }
        let dest = secure_join(rootfs, &device.path)
            .map_err(|e| io_failure(SetupStage::Device, &device.path, &e))?;
        create_mount_point(&dest, false)
            .map_err(|e| io_failure(SetupStage::Device, &device.path, &e))?;
        mount(
            Some(&device.path),
            &dest,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| SetupFailure::from_errno(SetupStage::Device, e).with_target(device.path.display()))?;
    }
    Ok(skipped)
}

pub fn create_dev_symlinks(rootfs: &Path, links: &[(PathBuf, PathBuf)]) -> Result<(), SetupFailure> {
    for (link, target) in links {
        let dest = secure_join(rootfs, link).map_err(|e| io_failure(SetupStage::Device, link, &e))?;
        match std::os::unix::fs::symlink(target, &dest) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(io_failure(SetupStage::Device, link, &err)),
        }
    }
    Ok(())
}

/// Make `rootfs` the root of this mount namespace and detach the old root.
pub fn pivot_into(rootfs: &Path) -> Result<(), SetupFailure> {
    let failure = |e: Errno| SetupFailure::from_errno(SetupStage::PivotRoot, e).with_target(rootfs.display());
    chdir(rootfs).map_err(failure)?;
    pivot_root(".", ".").map_err(failure)?;
    umount2(".", MntFlags::MNT_DETACH).map_err(failure)?;
    chdir("/").map_err(failure)
}

/// Hide `paths`: directories under an empty read-only tmpfs, files under
/// `/dev/null`. Runs after the pivot, so paths are container paths.
pub fn mask_paths(paths: &[PathBuf]) -> Result<(), SetupFailure> {
    for path in paths {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_failure(SetupStage::Mask, path, &err)),
        };
        let result = if meta.is_dir() {
            mount(
                Some("tmpfs"),
                path,
                Some("tmpfs"),
                MsFlags::MS_RDONLY,
                None::<&str>,
            )
        } else {
            mount(
                Some("/dev/null"),
                path,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
        };
        result.map_err(|e| SetupFailure::from_errno(SetupStage::Mask, e).with_target(path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nothing_is_default() {
        let parsed = MountOptions::parse::<&str>(&[]);
        assert_eq!(parsed, MountOptions::default());
        assert!(parsed.flags.is_empty());
        assert_eq!(parsed.data(), None);
        assert_eq!(MountOptions::parse(&["defaults"]), MountOptions::default());
    }

    #[test]
    fn test_parse_tmpfs_options() {
        let parsed = MountOptions::parse(&["nosuid", "noexec", "nodev", "size=16M", "rprivate"]);
        assert_eq!(
            parsed.flags,
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV
        );
        assert_eq!(parsed.propagation, vec![MsFlags::MS_PRIVATE | MsFlags::MS_REC]);
        assert_eq!(parsed.data(), Some("size=16M".to_string()));
    }

    #[test]
    fn test_parse_dev_options() {
        let parsed = MountOptions::parse(&["nosuid", "strictatime", "mode=755", "size=65536k"]);
        assert_eq!(parsed.flags, MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME);
        assert_eq!(parsed.data(), Some("mode=755,size=65536k".to_string()));
    }

    #[test]
    fn test_rw_clears_ro() {
        let parsed = MountOptions::parse(&["ro", "rbind", "rw"]);
        assert_eq!(parsed.flags, MsFlags::MS_BIND | MsFlags::MS_REC);
        assert!(parsed.remount_flags().is_empty());

        let read_only = MountOptions::parse(&["rbind", "ro"]);
        assert_eq!(read_only.remount_flags(), MsFlags::MS_RDONLY);
    }

    #[test]
    fn test_secure_join_plain_and_dotdot() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        assert_eq!(
            secure_join(root, Path::new("/usr/bin")).unwrap(),
            root.join("usr/bin")
        );
        assert_eq!(
            secure_join(root, Path::new("/../../etc")).unwrap(),
            root.join("etc")
        );
    }

    #[test]
    fn test_secure_join_reroots_absolute_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("run")).unwrap();
        fs::create_dir_all(root.join("var")).unwrap();
        std::os::unix::fs::symlink("/run", root.join("var/run")).unwrap();
        // Escapes to the host root if followed naively.
        std::os::unix::fs::symlink("/etc", root.join("escape")).unwrap();

        assert_eq!(
            secure_join(root, Path::new("/var/run/pkgjail")).unwrap(),
            root.join("run/pkgjail")
        );
        assert_eq!(
            secure_join(root, Path::new("/escape/passwd")).unwrap(),
            root.join("etc/passwd")
        );
    }

    #[test]
    fn test_secure_join_relative_symlink_cannot_climb_out() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a")).unwrap();
        std::os::unix::fs::symlink("../../../../tmp", root.join("a/up")).unwrap();

        assert_eq!(
            secure_join(root, Path::new("/a/up/x")).unwrap(),
            root.join("tmp/x")
        );
    }

    #[test]
    fn test_secure_join_detects_loops() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::os::unix::fs::symlink("/loop", root.join("loop")).unwrap();

        let err = secure_join(root, Path::new("/loop/x")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ELOOP));
    }

    #[test]
    fn test_create_mount_point_for_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dev/null");
        create_mount_point(&dest, false).unwrap();
        assert!(dest.is_file());
        // Existing mount points are fine.
        create_mount_point(&dest, false).unwrap();
    }
}
