use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{FileInfo, FilterFs, Fs, FsFile, OsFs, Predicate};

/// Filesystem callbacks of the script interpreter. Relative paths are resolved
/// against the interpreter's `cwd`.
pub trait FsHandler: Send + Sync {
    /// Entries of a directory, sorted by name.
    fn read_dir(&self, cwd: &Path, path: &Path) -> io::Result<Vec<FileInfo>>;

    fn stat(&self, cwd: &Path, path: &Path, follow_symlinks: bool) -> io::Result<FileInfo>;

    fn open(&self, cwd: &Path, path: &Path, flags: i32, mode: u32) -> io::Result<Box<dyn FsFile>>;
}

fn resolve(cwd: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[derive(Clone, Default)]
pub struct RestrictedOptions {
    filter: Option<Predicate>,
}

impl RestrictedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Predicate) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// [`FsHandler`] backed by the host filesystem, optionally behind a predicate.
pub struct RestrictedHandlers {
    fs: Box<dyn Fs>,
}

impl RestrictedHandlers {
    pub fn new(options: RestrictedOptions) -> Self {
        let fs: Box<dyn Fs> = match options.filter {
            Some(pred) => Box::new(FilterFs::new(OsFs, pred)),
            None => Box::new(OsFs),
        };
        Self { fs }
    }
}

impl FsHandler for RestrictedHandlers {
    fn read_dir(&self, cwd: &Path, path: &Path) -> io::Result<Vec<FileInfo>> {
        let path = resolve(cwd, path);
        let mut dir = self.fs.open(&path)?;
        let mut infos = dir.readdir(None)?;
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    fn stat(&self, cwd: &Path, path: &Path, follow_symlinks: bool) -> io::Result<FileInfo> {
        let path = resolve(cwd, path);
        if follow_symlinks {
            self.fs.stat(&path)
        } else {
            self.fs.lstat_if_possible(&path).map(|(info, _)| info)
        }
    }

    fn open(&self, cwd: &Path, path: &Path, flags: i32, mode: u32) -> io::Result<Box<dyn FsFile>> {
        let path = resolve(cwd, path);
        debug!(path = %path.display(), flags, mode = format_args!("{mode:o}"), "open");
        self.fs.open_file(&path, flags, mode)
    }
}

/// Handlers for evaluating scripts without touching the filesystem: nothing
/// exists, and opened files read empty and swallow writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopFsHandler;

impl FsHandler for NopFsHandler {
    fn read_dir(&self, _cwd: &Path, _path: &Path) -> io::Result<Vec<FileInfo>> {
        Err(io::ErrorKind::NotFound.into())
    }

    fn stat(&self, _cwd: &Path, _path: &Path, _follow_symlinks: bool) -> io::Result<FileInfo> {
        Err(io::ErrorKind::NotFound.into())
    }

    fn open(&self, _cwd: &Path, path: &Path, _flags: i32, _mode: u32) -> io::Result<Box<dyn FsFile>> {
        Ok(Box::new(NopFile {
            path: path.to_path_buf(),
        }))
    }
}

#[derive(Debug)]
pub struct NopFile {
    path: PathBuf,
}

impl Read for NopFile {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for NopFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for NopFile {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Ok(0)
    }
}

impl FsFile for NopFile {
    fn name(&self) -> &Path {
        &self.path
    }

    fn readdir(&mut self, _count: Option<usize>) -> io::Result<Vec<FileInfo>> {
        Ok(Vec::new())
    }

    fn metadata(&self) -> io::Result<FileInfo> {
        Err(io::ErrorKind::NotFound.into())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate(&self, _size: u64) -> io::Result<()> {
        Ok(())
    }
}
