//! File-based storage backend using position-based I/O (`pread`/`pwrite`).
//!
//! On Unix, reads are completely lock-free via [`std::os::unix::fs::FileExt`]:
//! `read_exact_at()` takes `&self` and never touches the file cursor, allowing
//! concurrent reads from multiple threads with zero synchronization.
//!
//! Writes are serialized via a lightweight [`parking_lot::Mutex`] guard (not
//! wrapping the `File`, just a unit `()` sentinel) to prevent concurrent
//! file extensions and torn writes.
//!
//! Each open file holds an advisory lock (`fs2`): exclusive for read-write
//! handles, shared for read-only handles. A second read-write handle on the
//! same file fails with [`Error::Locked`].

#[cfg(unix)]
use std::os::unix::fs::{FileExt, OpenOptionsExt};
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use super::{META_SLOT_SIZE, META_SLOTS, MetaSlot, StorageBackend, validate_page_size};
use crate::error::{Error, PageId, Result};

/// Default permission bits for newly created database files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// File-based storage backend.
///
/// Uses position-based I/O (`pread`/`pwrite`) for page access. Durability
/// requires the caller to invoke [`sync`](StorageBackend::sync) after writes;
/// crash safety comes from the alternating meta slots, not from this backend.
pub struct FileBackend {
    /// The underlying file handle. Holds the advisory lock while open.
    file: File,
    /// Serializes writes and file extension operations.
    write_lock: Mutex<()>,
    /// Page size in bytes.
    page_size: usize,
    /// Location of the database file, used for compaction renames and errors.
    path: PathBuf,
    /// Permission bits used when creating sibling files.
    file_mode: u32,
}

impl FileBackend {
    /// Opens an existing database file and reads its page size from the meta slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or read.
    /// Returns [`Error::Locked`] if another handle holds a conflicting lock.
    /// Returns [`Error::Corrupted`] if the file is too short or both meta slots are invalid.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(!read_only).open(&path)?;
        lock_file(&file, &path, read_only)?;

        let len = file.metadata()?.len();
        if len < (META_SLOT_SIZE * META_SLOTS) as u64 {
            return Err(Error::Corrupted {
                reason: format!("File too short for meta slots: {len} bytes"),
            });
        }

        let mut slots = vec![0u8; META_SLOT_SIZE * META_SLOTS];
        read_exact_at_offset(&file, &mut slots, 0)?;
        let (meta, _) = MetaSlot::select(&slots[..META_SLOT_SIZE], &slots[META_SLOT_SIZE..])?;
        let file_mode = file_mode_of(&file)?;

        Ok(Self {
            file,
            write_lock: Mutex::new(()),
            page_size: meta.page_size as usize,
            path,
            file_mode,
        })
    }

    /// Creates a new database file, writing `initial` into both meta slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created or written.
    /// Returns [`Error::InvalidConfig`] if the page size is unsupported.
    /// Returns [`Error::Locked`] if another handle holds the file.
    pub fn create(path: impl AsRef<Path>, initial: &MetaSlot, file_mode: u32) -> Result<Self> {
        let backend = Self::create_empty(path.as_ref(), initial.page_size as usize, file_mode)?;

        let bytes = initial.to_bytes();
        for slot in 0..META_SLOTS {
            backend.write_meta(slot, &bytes)?;
        }
        backend.file.set_len(backend.page_size as u64)?;
        backend.file.sync_all()?;

        Ok(backend)
    }

    /// Creates (or truncates) a file with no meta slots written yet.
    fn create_empty(path: &Path, page_size: usize, file_mode: u32) -> Result<Self> {
        validate_page_size(page_size)?;

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        options.mode(file_mode);
        let file = options.open(path)?;
        lock_file(&file, path, false)?;
        // Truncate only once the lock is held, so a locked file is never clobbered.
        file.set_len(0)?;

        Ok(Self {
            file,
            write_lock: Mutex::new(()),
            page_size,
            path: path.to_path_buf(),
            file_mode,
        })
    }

    /// Returns the path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compaction_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".compact");
        PathBuf::from(name)
    }
}

impl StorageBackend for FileBackend {
    fn read_meta(&self, slot: usize) -> Result<Vec<u8>> {
        let offset = meta_offset(slot)?;
        let mut buf = vec![0u8; META_SLOT_SIZE];
        if offset + META_SLOT_SIZE as u64 <= self.file.metadata()?.len() {
            read_exact_at_offset(&self.file, &mut buf, offset)?;
        }
        Ok(buf)
    }

    fn write_meta(&self, slot: usize, data: &[u8]) -> Result<()> {
        let offset = meta_offset(slot)?;
        if data.len() != META_SLOT_SIZE {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid meta slot size: {} (expected {META_SLOT_SIZE})",
                    data.len()
                ),
            });
        }

        let _guard = self.write_lock.lock();
        write_all_at_offset(&self.file, data, offset)?;
        Ok(())
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let offset = self.page_offset(page_id);

        let file_len = self.file.metadata()?.len();
        if offset + self.page_size as u64 > file_len {
            return Ok(vec![0u8; self.page_size]);
        }

        let mut buf = vec![0u8; self.page_size];
        read_exact_at_offset(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid page data size: {} (expected {})",
                    data.len(),
                    self.page_size
                ),
            });
        }
        if page_id == 0 {
            return Err(Error::Corrupted { reason: "Page 0 is reserved for meta slots".into() });
        }

        let offset = self.page_offset(page_id);

        let _guard = self.write_lock.lock();
        let file_len = self.file.metadata()?.len();
        let required_len = offset + self.page_size as u64;
        if file_len < required_len {
            self.file.set_len(required_len)?;
        }

        write_all_at_offset(&self.file, data, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn create_compaction_target(&self) -> Result<Self> {
        Self::create_empty(&self.compaction_path(), self.page_size, self.file_mode)
    }

    fn install_compacted(&mut self, target: Self) -> Result<()> {
        // The replacement keeps the original's permissions whatever the umask
        // or a leftover target file applied.
        target.file.set_permissions(self.file.metadata()?.permissions())?;
        target.file.sync_all()?;
        std::fs::rename(&target.path, &self.path)?;
        sync_parent_dir(&self.path)?;

        let path = std::mem::take(&mut self.path);
        *self = Self { path, ..target };
        Ok(())
    }
}

fn meta_offset(slot: usize) -> Result<u64> {
    if slot >= META_SLOTS {
        return Err(Error::Corrupted { reason: format!("Invalid meta slot index {slot}") });
    }
    Ok((slot * META_SLOT_SIZE) as u64)
}

/// Takes the advisory lock for a handle.
fn lock_file(file: &File, path: &Path, shared: bool) -> Result<()> {
    let result = if shared {
        fs2::FileExt::try_lock_shared(file)
    } else {
        fs2::FileExt::try_lock_exclusive(file)
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
            tracing::debug!(path = %path.display(), "Database file lock is held elsewhere");
            Err(Error::Locked { path: path.display().to_string() })
        },
        Err(err) => Err(err.into()),
    }
}

/// Permission bits of an open file.
#[cfg(unix)]
fn file_mode_of(file: &File) -> io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;

    Ok(file.metadata()?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode_of(_file: &File) -> io::Result<u32> {
    Ok(DEFAULT_FILE_MODE)
}

/// Makes a rename durable by syncing the containing directory.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => File::open(".")?.sync_all(),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

/// Reads exactly `buf.len()` bytes from `file` at the given byte `offset`.
#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// Windows fallback: `seek_read` updates the file cursor, so this is NOT
/// lock-free.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

/// Writes all of `data` to `file` at the given byte `offset`.
#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

/// Windows fallback for positional writes.
#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
