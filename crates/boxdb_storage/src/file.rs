//! File-backed storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How a [`FileBackend`] opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOptions {
    /// Create the file when it does not exist.
    pub create: bool,
    /// Reject every mutation with [`StorageError::ReadOnly`].
    pub read_only: bool,
    /// Unix permission bits applied when the file is created.
    pub mode: Option<u32>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            create: true,
            read_only: false,
            mode: None,
        }
    }
}

impl FileOptions {
    /// Options for a read-only backend over an existing file.
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            create: false,
            read_only: true,
            mode: None,
        }
    }

    /// Sets the permission bits used when creating the file.
    #[must_use]
    pub const fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// A backend that stores its bytes in one regular file.
///
/// Reads seek under a lock, so a `FileBackend` can be shared behind a
/// reader/writer lock with concurrent readers.
///
/// ```no_run
/// use boxdb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("objects.dat")).unwrap();
/// backend.append(b"payload").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
    read_only: bool,
}

impl FileBackend {
    /// Opens `path` for reading and appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with(path, FileOptions::default())
    }

    /// Opens `path` with explicit [`FileOptions`].
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened, or does not exist and
    /// `options.create` is false.
    pub fn open_with(path: &Path, options: FileOptions) -> StorageResult<Self> {
        let mut open = OpenOptions::new();
        open.read(true);
        if !options.read_only {
            open.write(true).create(options.create).truncate(false);
        }
        apply_mode(&mut open, options.mode);

        let file = open.open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size,
            read_only: options.read_only,
        })
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the backend rejects mutations.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.read_only {
            Err(StorageError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

#[cfg(unix)]
fn apply_mode(open: &mut OpenOptions, mode: Option<u32>) {
    use std::os::unix::fs::OpenOptionsExt;
    if let Some(mode) = mode {
        open.mode(mode);
    }
}

#[cfg(not(unix))]
fn apply_mode(_open: &mut OpenOptions, _mode: Option<u32>) {}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.size) {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.size,
            });
        }
        let mut buf = vec![0u8; len];
        if len > 0 {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.ensure_writable()?;
        let offset = self.size;
        if data.is_empty() {
            return Ok(offset);
        }
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if !self.read_only {
            self.file.get_mut().flush()?;
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        if !self.read_only {
            self.file.get_mut().sync_all()?;
        }
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.ensure_writable()?;
        if new_size > self.size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: self.size,
            });
        }
        let file = self.file.get_mut();
        file.set_len(new_size)?;
        file.sync_all()?;
        self.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_are_readable_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("objects.dat");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            assert_eq!(backend.append(b"first").unwrap(), 0);
            assert_eq!(backend.append(b"second").unwrap(), 5);
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(5, 6).unwrap(), b"second");
    }

    #[test]
    fn read_past_end_is_rejected() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("x")).unwrap();
        backend.append(b"abc").unwrap();

        assert!(matches!(
            backend.read_at(2, 5),
            Err(StorageError::ReadPastEnd { size: 3, .. })
        ));
        assert!(backend.read_at(3, 0).unwrap().is_empty());
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.dat");
        FileBackend::open(&path).unwrap().append(b"data").unwrap();

        let mut backend = FileBackend::open_with(&path, FileOptions::read_only()).unwrap();
        assert!(backend.is_read_only());
        assert_eq!(backend.read_at(0, 4).unwrap(), b"data");
        assert!(matches!(backend.append(b"x"), Err(StorageError::ReadOnly)));
        assert!(matches!(backend.truncate(0), Err(StorageError::ReadOnly)));
    }

    #[test]
    fn read_only_does_not_create() {
        let dir = tempdir().unwrap();
        let result = FileBackend::open_with(&dir.path().join("missing"), FileOptions::read_only());
        assert!(result.is_err());
    }

    #[test]
    fn truncate_shrinks_only() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("t")).unwrap();
        backend.append(b"hello world").unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.size().unwrap(), 5);
        assert!(matches!(
            backend.truncate(50),
            Err(StorageError::InvalidTruncate { requested: 50, size: 5 })
        ));
        assert_eq!(backend.append(b"!").unwrap(), 5);
        assert_eq!(backend.read_at(0, 6).unwrap(), b"hello!");
    }

    #[cfg(unix)]
    #[test]
    fn created_file_uses_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("mode.dat");
        FileBackend::open_with(&path, FileOptions::default().with_mode(0o600)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
