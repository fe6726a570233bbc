//! Host-side filesystem boundary for operations the script interpreter performs
//! itself (globbing, `[ -f ]` tests, redirections) rather than via subprocess.

mod filter;
mod handlers;
mod restrict;

use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub use filter::{FilterFile, FilterFs, Predicate};
pub use handlers::{FsHandler, NopFile, NopFsHandler, RestrictedHandlers, RestrictedOptions};
pub use restrict::{
    DEFAULT_SOCKET_DIR, DEFAULT_SYSTEM_CACHE_DIR, clean_path, has_path_prefix, restrict_sandbox,
    restrict_sandbox_with,
};

/// A directory entry or stat result.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub metadata: fs::Metadata,
}

impl FileInfo {
    fn from_path(path: &Path, metadata: fs::Metadata) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { name, metadata }
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    pub fn len(&self) -> u64 {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.len() == 0
    }
}

/// An open file or directory handle.
pub trait FsFile: Read + Write + Seek + Send {
    fn name(&self) -> &Path;

    /// Next directory entries. `None` reads all remaining entries; `Some(n)` at
    /// most `n`, continuing where the previous call stopped.
    fn readdir(&mut self, count: Option<usize>) -> io::Result<Vec<FileInfo>>;

    fn readdir_names(&mut self, count: Option<usize>) -> io::Result<Vec<String>> {
        Ok(self
            .readdir(count)?
            .into_iter()
            .map(|info| info.name)
            .collect())
    }

    fn metadata(&self) -> io::Result<FileInfo>;

    fn sync(&self) -> io::Result<()>;

    fn truncate(&self, size: u64) -> io::Result<()>;
}

/// Filesystem operations, with paths as seen by the interpreter.
pub trait Fs: Send + Sync {
    fn name(&self) -> String;

    fn open(&self, path: &Path) -> io::Result<Box<dyn FsFile>>;

    /// Open with raw `open(2)` flags and creation mode.
    fn open_file(&self, path: &Path, flags: i32, mode: u32) -> io::Result<Box<dyn FsFile>>;

    fn create(&self, path: &Path) -> io::Result<Box<dyn FsFile>>;

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    fn remove_all(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;

    fn stat(&self, path: &Path) -> io::Result<FileInfo>;

    /// `lstat` result, and whether `lstat` was actually used.
    fn lstat_if_possible(&self, path: &Path) -> io::Result<(FileInfo, bool)>;
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl Fs for OsFs {
    fn name(&self) -> String {
        "OsFs".to_string()
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn FsFile>> {
        Ok(Box::new(OsFile::new(path, File::open(path)?)))
    }

    fn open_file(&self, path: &Path, flags: i32, mode: u32) -> io::Result<Box<dyn FsFile>> {
        let access = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .custom_flags(flags & !libc::O_ACCMODE)
            .mode(mode)
            .open(path)?;
        Ok(Box::new(OsFile::new(path, file)))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn FsFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(path)?;
        Ok(Box::new(OsFile::new(path, file)))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().mode(mode).create(path)
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir(path),
            _ => fs::remove_file(path),
        }
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        std::os::unix::fs::chown(path, uid, gid)
    }

    fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let times = FileTimes::new().set_accessed(atime).set_modified(mtime);
        File::open(path)?.set_times(times)
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        Ok(FileInfo::from_path(path, fs::metadata(path)?))
    }

    fn lstat_if_possible(&self, path: &Path) -> io::Result<(FileInfo, bool)> {
        Ok((FileInfo::from_path(path, fs::symlink_metadata(path)?), true))
    }
}

/// Handle returned by [`OsFs`].
#[derive(Debug)]
pub struct OsFile {
    path: PathBuf,
    file: File,
    entries: Option<fs::ReadDir>,
}

impl OsFile {
    fn new(path: &Path, file: File) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            entries: None,
        }
    }
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for OsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl FsFile for OsFile {
    fn name(&self) -> &Path {
        &self.path
    }

    fn readdir(&mut self, count: Option<usize>) -> io::Result<Vec<FileInfo>> {
        if self.entries.is_none() {
            if !self.file.metadata()?.is_dir() {
                return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
            }
            self.entries = Some(fs::read_dir(&self.path)?);
        }
        let Some(entries) = self.entries.as_mut() else {
            return Ok(Vec::new());
        };

        let limit = count.unwrap_or(usize::MAX);
        let mut infos = Vec::new();
        while infos.len() < limit {
            let Some(entry) = entries.next() else {
                break;
            };
            let entry = entry?;
            infos.push(FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                metadata: entry.metadata()?,
            });
        }
        Ok(infos)
    }

    fn metadata(&self) -> io::Result<FileInfo> {
        Ok(FileInfo::from_path(&self.path, self.file.metadata()?))
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }
}
