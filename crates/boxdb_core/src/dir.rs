//! Store directory management.
//!
//! ```text
//! <dir>/
//! ├─ MANIFEST   # format version, schema, ID sequences, checkpoint
//! ├─ LOCK       # advisory lock, one writing process at a time
//! ├─ wal.log    # write-ahead log
//! └─ data.seg   # every committed record version
//! ```

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use boxdb_storage::{FileBackend, FileOptions, InMemoryBackend, StorageBackend};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";
const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const DATA_FILE: &str = "data.seg";

/// An opened store directory holding the process lock.
///
/// Writable opens take an exclusive lock, read-only opens a shared one, so
/// a second writer gets [`CoreError::DatabaseLocked`].
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    read_only: bool,
    file_mode: u32,
    _lock_file: File,
}

impl StoreDir {
    /// Opens (and unless read-only, creates) the directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseLocked`] if another process holds the
    /// lock, [`CoreError::IllegalArgument`] if a read-only open finds no
    /// store, or an I/O error.
    pub fn open(path: &Path, read_only: bool, file_mode: u32) -> CoreResult<Self> {
        if !path.exists() {
            if read_only {
                return Err(CoreError::illegal_argument(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::illegal_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = if read_only && !lock_path.exists() {
            File::open(path.join(MANIFEST_FILE))?
        } else {
            OpenOptions::new()
                .read(true)
                .write(!read_only)
                .create(!read_only)
                .truncate(false)
                .open(&lock_path)?
        };
        let locked = if read_only {
            FileExt::try_lock_shared(&lock_file)
        } else {
            FileExt::try_lock_exclusive(&lock_file)
        };
        if locked.is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            read_only,
            file_mode,
            _lock_file: lock_file,
        })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the WAL file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Path of the data file.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.path.join(DATA_FILE)
    }

    /// Path of the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    fn backend(&self, path: &Path) -> CoreResult<Box<dyn StorageBackend>> {
        if self.read_only {
            if !path.exists() {
                return Ok(Box::new(InMemoryBackend::new()));
            }
            return Ok(Box::new(FileBackend::open_with(path, FileOptions::read_only())?));
        }
        let options = FileOptions::default().with_mode(self.file_mode);
        Ok(Box::new(FileBackend::open_with(path, options)?))
    }

    /// Opens the WAL backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn wal_backend(&self) -> CoreResult<Box<dyn StorageBackend>> {
        self.backend(&self.wal_path())
    }

    /// Opens the data file backend.
    ///
    /// A read-only store works on a private in-memory copy, so WAL
    /// transactions not yet in the file can still be replayed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn data_backend(&self) -> CoreResult<Box<dyn StorageBackend>> {
        let path = self.data_path();
        if self.read_only {
            return match fs::read(&path) {
                Ok(bytes) => Ok(Box::new(InMemoryBackend::with_data(bytes))),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    Ok(Box::new(InMemoryBackend::new()))
                }
                Err(err) => Err(err.into()),
            };
        }
        self.backend(&path)
    }

    /// Loads the manifest; `None` for a new store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or decoded.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        let mut file = match File::open(self.manifest_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(None);
        }
        Manifest::decode(&data).map(Some)
    }

    /// Writes the manifest through a temporary file and a rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is read-only or any I/O step fails.
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::illegal_state("store is read-only"));
        }
        let temp_path = self.path.join(MANIFEST_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&manifest.encode())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, self.manifest_path())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }

    /// Total size of the store files.
    ///
    /// # Errors
    ///
    /// Returns an I/O error other than a missing file.
    pub fn size_on_disk(&self) -> CoreResult<u64> {
        db_file_size(&self.path)
    }
}

/// Sums the sizes of the store files in `dir`; missing files count as 0.
///
/// # Errors
///
/// Returns an I/O error other than a missing file.
pub fn db_file_size(dir: &Path) -> CoreResult<u64> {
    let mut total = 0;
    for name in [MANIFEST_FILE, WAL_FILE, DATA_FILE] {
        match fs::metadata(dir.join(name)) {
            Ok(meta) => total += meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(total)
}

/// Deletes the store files in `dir`, and `dir` itself once it is empty.
///
/// # Errors
///
/// Returns [`CoreError::DatabaseLocked`] if the store is open, or an I/O
/// error other than a missing file.
pub fn remove_db_files(dir: &Path) -> CoreResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    let lock_path = dir.join(LOCK_FILE);
    if lock_path.exists() {
        let lock = OpenOptions::new().read(true).write(true).open(&lock_path)?;
        if FileExt::try_lock_exclusive(&lock).is_err() {
            return Err(CoreError::DatabaseLocked);
        }
    }
    for name in [MANIFEST_FILE, MANIFEST_TEMP, WAL_FILE, DATA_FILE, LOCK_FILE] {
        match fs::remove_file(dir.join(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    if fs::read_dir(dir)?.next().is_none() {
        fs::remove_dir(dir)?;
    }
    tracing::info!(dir = %dir.display(), "removed store files");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let dir = StoreDir::open(&path, false, 0o644).unwrap();
        assert!(path.is_dir());
        assert!(dir.wal_path().ends_with("wal.log"));
        assert!(dir.load_manifest().unwrap().is_none());
    }

    #[test]
    fn second_writer_is_locked_out() {
        let temp = tempdir().unwrap();
        let _first = StoreDir::open(temp.path(), false, 0o644).unwrap();
        assert!(matches!(
            StoreDir::open(temp.path(), false, 0o644),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn readers_share_the_lock() {
        let temp = tempdir().unwrap();
        {
            let dir = StoreDir::open(temp.path(), false, 0o644).unwrap();
            dir.save_manifest(&Manifest::default()).unwrap();
        }
        let first = StoreDir::open(temp.path(), true, 0o644).unwrap();
        let second = StoreDir::open(temp.path(), true, 0o644).unwrap();
        assert!(matches!(
            StoreDir::open(temp.path(), false, 0o644),
            Err(CoreError::DatabaseLocked)
        ));
        drop(first);
        drop(second);
        let _writer = StoreDir::open(temp.path(), false, 0o644).unwrap();
        assert!(matches!(
            StoreDir::open(temp.path(), true, 0o644),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn read_only_requires_existing_directory() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("nope");
        assert!(matches!(
            StoreDir::open(&missing, true, 0o644),
            Err(CoreError::IllegalArgument { .. })
        ));
    }

    #[test]
    fn manifest_survives_reopen() {
        let temp = tempdir().unwrap();
        let mut manifest = Manifest::default();
        manifest.id_sequences.insert(3, 9);
        {
            let dir = StoreDir::open(temp.path(), false, 0o644).unwrap();
            dir.save_manifest(&manifest).unwrap();
        }
        let dir = StoreDir::open(temp.path(), false, 0o644).unwrap();
        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
    }

    #[test]
    fn remove_and_size() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        {
            let dir = StoreDir::open(&path, false, 0o644).unwrap();
            dir.save_manifest(&Manifest::default()).unwrap();
            assert!(dir.size_on_disk().unwrap() > 0);
        }
        remove_db_files(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(db_file_size(&path).unwrap(), 0);
    }

    #[test]
    fn remove_refuses_open_store() {
        let temp = tempdir().unwrap();
        let _dir = StoreDir::open(temp.path(), false, 0o644).unwrap();
        assert!(matches!(
            remove_db_files(temp.path()),
            Err(CoreError::DatabaseLocked)
        ));
    }
}
