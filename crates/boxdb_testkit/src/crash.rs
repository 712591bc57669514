//! Crash simulation for on-disk stores.
//!
//! A crash is simulated by copying the files of a store that is still open
//! into a fresh directory. The copy holds exactly what reached the OS, the
//! way the directory would look after the process died. Damage helpers then
//! cut or flip bytes to simulate torn writes and media errors before the
//! copy is opened.
//!
//! ```rust,ignore
//! let store = TestStore::file();
//! // ... commits ...
//! let image = crash_image(store.path().unwrap());
//! truncate_tail(&image.path().join(DATA_FILE), 10);
//! let recovered = Store::open(StoreOptions::new().directory(image.path()).model(person_model()))?;
//! ```

use boxdb_storage::{FileBackend, StorageBackend, StorageResult};
use std::fs;
use std::io;
use std::path::Path;
use tempfile::TempDir;

/// Name of the write-ahead log inside a store directory.
pub const WAL_FILE: &str = "wal.log";
/// Name of the data file inside a store directory.
pub const DATA_FILE: &str = "data.seg";
/// Name of the manifest inside a store directory.
pub const MANIFEST_FILE: &str = "MANIFEST";

/// Where a simulated crash damages the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The last data file write was torn.
    DataFileTail(u64),
    /// The last WAL write was torn.
    WalTail(u64),
    /// The data file fell back to the given length, for example the length
    /// recorded right after a checkpoint. Commits after it survive only in
    /// the WAL.
    DataFileAt(u64),
}

/// Copies the files of `store_dir` into a new temporary directory.
///
/// The lock file is left behind, so the copy opens while the original
/// store is still running.
///
/// # Panics
///
/// If the directory cannot be read or copied.
pub fn crash_image(store_dir: &Path) -> TempDir {
    let image = TempDir::new().expect("create crash image directory");
    for name in [MANIFEST_FILE, WAL_FILE, DATA_FILE] {
        let from = store_dir.join(name);
        if from.exists() {
            fs::copy(&from, image.path().join(name)).expect("copy store file");
        }
    }
    image
}

/// Copies `store_dir` and applies `point` to the copy.
///
/// # Panics
///
/// If copying or damaging the files fails.
pub fn crash_at(store_dir: &Path, point: CrashPoint) -> TempDir {
    let image = crash_image(store_dir);
    let result = match point {
        CrashPoint::DataFileTail(bytes) => truncate_tail(&image.path().join(DATA_FILE), bytes),
        CrashPoint::WalTail(bytes) => truncate_tail(&image.path().join(WAL_FILE), bytes),
        CrashPoint::DataFileAt(len) => truncate_to(&image.path().join(DATA_FILE), len),
    };
    result.expect("damage crash image");
    image
}

/// Cuts `bytes` off the end of a file, as a torn write would.
///
/// # Errors
///
/// Fails if the file cannot be opened or truncated.
pub fn truncate_tail(path: &Path, bytes: u64) -> StorageResult<()> {
    let mut backend = FileBackend::open(path)?;
    let size = backend.size()?;
    backend.truncate(size.saturating_sub(bytes))
}

/// Truncates a file to `len` bytes.
///
/// # Errors
///
/// Fails if the file cannot be opened or is shorter than `len`.
pub fn truncate_to(path: &Path, len: u64) -> StorageResult<()> {
    let mut backend = FileBackend::open(path)?;
    backend.truncate(len)
}

/// XORs the byte at `offset` with `mask`.
///
/// # Errors
///
/// Fails if the file cannot be read or written, or is too short.
pub fn flip_byte(path: &Path, offset: u64, mask: u8) -> io::Result<()> {
    let mut bytes = fs::read(path)?;
    let index = usize::try_from(offset).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let byte = bytes
        .get_mut(index)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "offset past end of file"))?;
    *byte ^= mask;
    fs::write(path, bytes)
}

/// Size of a file, 0 if it does not exist.
pub fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map_or(0, |m| m.len())
}
