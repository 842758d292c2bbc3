//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Unsynced log kept in a single file.
///
/// `flush()` hands data to the OS, `sync()` calls `File::sync_all()`.
///
/// The staging log must only ever be written by one engine, so
/// [`FileBackend::open_exclusive`] takes an advisory lock that is released
/// when the backend is dropped.
///
/// ```no_run
/// use zonesync_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open_exclusive(Path::new("unsynced.log")).unwrap();
/// backend.append(b"entry").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    handle: Mutex<Handle>,
    locked: bool,
}

/// The open file and its logical length, updated together.
#[derive(Debug)]
struct Handle {
    file: File,
    len: u64,
}

impl Handle {
    fn check_range(&self, offset: u64, len: usize) -> StorageResult<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.len,
            }),
        }
    }
}

impl FileBackend {
    /// Opens or creates a file without locking it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with(path, false)
    }

    /// Opens or creates a file and takes an exclusive advisory lock on it,
    /// creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the lock.
    pub fn open_exclusive(path: &Path) -> StorageResult<Self> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }
        Self::open_with(path, true)
    }

    fn open_with(path: &Path, exclusive: bool) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if exclusive && file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: path.display().to_string(),
            });
        }
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            handle: Mutex::new(Handle { file, len }),
            locked: exclusive,
        })
    }

    /// Location of the log on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if this backend holds the exclusive lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut handle = self.handle.lock();
        handle.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        if len > 0 {
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.read_exact(&mut out)?;
        }
        Ok(out)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let handle = self.handle.get_mut();
        let at = handle.len;
        if !data.is_empty() {
            handle.file.seek(SeekFrom::Start(at))?;
            handle.file.write_all(data)?;
            handle.len = at + data.len() as u64;
        }
        Ok(at)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(self.handle.get_mut().file.flush()?)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.handle.lock().len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(self.handle.get_mut().file.sync_all()?)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let handle = self.handle.get_mut();
        if new_size > handle.len {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size: handle.len,
            });
        }
        // Durable before the shorter length is trusted.
        handle.file.set_len(new_size)?;
        handle.file.sync_all()?;
        handle.len = new_size;
        Ok(())
    }
}
