use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use super::{FileInfo, Fs, FsFile};

/// Decides whether a path may be touched at all.
pub type Predicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Denied paths look exactly like missing ones.
fn denied() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

/// [`Fs`] wrapper that checks every target path against a predicate first.
pub struct FilterFs<F> {
    src: F,
    pred: Predicate,
}

impl<F: Fs> FilterFs<F> {
    pub fn new(src: F, pred: Predicate) -> Self {
        Self { src, pred }
    }

    fn check(&self, path: &Path) -> io::Result<()> {
        if (self.pred)(path) { Ok(()) } else { Err(denied()) }
    }
}

impl<F: Fs> Fs for FilterFs<F> {
    fn name(&self) -> String {
        format!("Filter: {}", self.src.name())
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn FsFile>> {
        self.check(path)?;
        let inner = self.src.open(path)?;
        Ok(Box::new(FilterFile {
            inner,
            pred: self.pred.clone(),
        }))
    }

    fn open_file(&self, path: &Path, flags: i32, mode: u32) -> io::Result<Box<dyn FsFile>> {
        self.check(path)?;
        self.src.open_file(path, flags, mode)
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn FsFile>> {
        self.check(path)?;
        self.src.create(path)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.check(path)?;
        self.src.mkdir(path, mode)
    }

    // Not checked.
    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.src.mkdir_all(path, mode)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.check(path)?;
        self.src.remove(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.check(path)?;
        self.src.remove_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check(from)?;
        self.check(to)?;
        self.src.rename(from, to)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.check(path)?;
        self.src.chmod(path, mode)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        self.check(path)?;
        self.src.chown(path, uid, gid)
    }

    fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        self.check(path)?;
        self.src.chtimes(path, atime, mtime)
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        self.check(path)?;
        self.src.stat(path)
    }

    fn lstat_if_possible(&self, path: &Path) -> io::Result<(FileInfo, bool)> {
        self.check(path)?;
        self.src.lstat_if_possible(path)
    }
}

/// Directory handle that hides children the predicate rejects.
pub struct FilterFile {
    inner: Box<dyn FsFile>,
    pred: Predicate,
}

impl Read for FilterFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for FilterFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for FilterFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl FsFile for FilterFile {
    fn name(&self) -> &Path {
        self.inner.name()
    }

    fn readdir(&mut self, count: Option<usize>) -> io::Result<Vec<FileInfo>> {
        let infos = self.inner.readdir(count)?;
        let dir = self.inner.name().to_path_buf();
        Ok(infos
            .into_iter()
            .filter(|info| (self.pred)(&dir.join(&info.name)))
            .collect())
    }

    fn metadata(&self) -> io::Result<FileInfo> {
        self.inner.metadata()
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.inner.truncate(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OsFs;
    use std::fs;

    fn deny_named(name: &'static str) -> Predicate {
        Arc::new(move |path: &Path| path.file_name().is_none_or(|n| n != name))
    }

    #[test]
    fn test_denied_path_reports_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let secret = tmp.path().join("secret");
        fs::write(&secret, "x").unwrap();

        let filtered = FilterFs::new(OsFs, deny_named("secret"));
        let err = filtered.stat(&secret).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert!(filtered.open(&secret).is_err());
        assert!(filtered.remove(&secret).is_err());
        assert!(secret.exists());
    }

    #[test]
    fn test_metadata_changes_on_denied_path_look_missing() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let secret = tmp.path().join("secret");
        let plain = tmp.path().join("plain");
        fs::write(&secret, "x").unwrap();
        fs::write(&plain, "x").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        let filtered = FilterFs::new(OsFs, deny_named("secret"));
        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;

        let err = filtered.chmod(&secret, 0o777).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(mode(secret.as_path()), 0o600);

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        let err = filtered.chtimes(&secret, when, when).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_ne!(fs::metadata(&secret).unwrap().modified().unwrap(), when);

        let err = filtered.chown(&secret, None, None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

        let err = filtered.create(&secret).err().unwrap();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(fs::read_to_string(&secret).unwrap(), "x");

        let err = filtered.remove_all(&secret).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert!(secret.exists());

        filtered.chmod(&plain, 0o640).unwrap();
        assert_eq!(mode(plain.as_path()), 0o640);
    }

    #[test]
    fn test_rename_checks_both_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a");
        fs::write(&src, "x").unwrap();

        let filtered = FilterFs::new(OsFs, deny_named("secret"));
        let err = filtered
            .rename(&src, &tmp.path().join("secret"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(src.exists());

        filtered.rename(&src, &tmp.path().join("b")).unwrap();
        assert!(tmp.path().join("b").exists());
    }

    #[test]
    fn test_mkdir_all_is_not_checked() {
        let tmp = tempfile::tempdir().unwrap();
        let filtered = FilterFs::new(OsFs, deny_named("secret"));

        assert!(filtered.mkdir(&tmp.path().join("secret"), 0o755).is_err());
        filtered
            .mkdir_all(&tmp.path().join("secret"), 0o755)
            .unwrap();
        assert!(tmp.path().join("secret").is_dir());
    }

    #[test]
    fn test_open_directory_hides_denied_children() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["visible", "secret", "other"] {
            fs::write(tmp.path().join(name), name).unwrap();
        }

        let filtered = FilterFs::new(OsFs, deny_named("secret"));
        let mut dir = filtered.open(tmp.path()).unwrap();
        let mut names = dir.readdir_names(None).unwrap();
        names.sort();
        assert_eq!(names, vec!["other", "visible"]);
    }

    #[test]
    fn test_name_wraps_source() {
        assert_eq!(
            FilterFs::new(OsFs, Arc::new(|_: &Path| true)).name(),
            "Filter: OsFs"
        );
    }
}
