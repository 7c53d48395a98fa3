//! Open file handles.
//!
//! A [`UnixFile`] owns the data descriptor, the optional directory
//! descriptor kept for durable journal creation, its logical lock level, and
//! the locking strategy chosen at open time.

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, instrument, trace, warn};

use crate::error::{FileContext, IoOp, Result, VfsError};
use crate::lock::registry::{FileId, LockKey};
use crate::lock::{LockLayout, LockLevel, LockStyle, LockTarget, Locker};
use crate::metrics::LockMetrics;
use crate::sync::{SyncFlags, SyncMode, sync_descriptor};
use crate::vfs::{FileKind, OpenFlags};

/// Sector size reported to the storage engine.
pub const SECTOR_SIZE: u32 = 512;

/// An open file with storage-engine locking.
///
/// Dropping the handle closes it; use [`UnixFile::close`] to observe errors.
#[derive(Debug)]
pub struct UnixFile {
    file: Option<File>,
    dir: Option<File>,
    path: Option<PathBuf>,
    level: LockLevel,
    locker: Option<Locker>,
    /// Pad byte written at open and not yet overwritten or truncated.
    padded: AtomicBool,
    layout: LockLayout,
    metrics: Arc<LockMetrics>,
    full_fsync: bool,
    flags: OpenFlags,
    kind: FileKind,
}

/// Everything [`crate::UnixVfs::open`] settled before building the handle.
pub(crate) struct OpenedParts {
    pub file: File,
    pub dir: Option<File>,
    pub path: Option<PathBuf>,
    pub locker: Locker,
    pub layout: LockLayout,
    pub metrics: Arc<LockMetrics>,
    pub full_fsync: bool,
    pub flags: OpenFlags,
    pub kind: FileKind,
}

impl UnixFile {
    pub(crate) fn new(parts: OpenedParts) -> Self {
        let padded = AtomicBool::new(parts.locker.padded());
        Self {
            file: Some(parts.file),
            dir: parts.dir,
            path: parts.path,
            level: LockLevel::None,
            locker: Some(parts.locker),
            padded,
            layout: parts.layout,
            metrics: parts.metrics,
            full_fsync: parts.full_fsync,
            flags: parts.flags,
            kind: parts.kind,
        }
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or(VfsError::misuse("file handle already closed"))
    }

    fn context(&self) -> FileContext {
        let ctx = FileContext::new().with_lock_level(self.level);
        match self.path {
            Some(ref path) => ctx.with_path(path),
            None => ctx,
        }
    }

    fn with_locker<R>(
        &mut self,
        f: impl FnOnce(&mut Locker, &mut LockTarget<'_>) -> Result<R>,
    ) -> Result<R> {
        let file = self
            .file
            .as_ref()
            .ok_or(VfsError::misuse("file handle already closed"))?;
        let locker = self
            .locker
            .as_mut()
            .ok_or(VfsError::misuse("file handle already closed"))?;
        let mut target = LockTarget {
            file,
            path: self.path.as_deref(),
            level: &mut self.level,
            layout: self.layout,
            metrics: &self.metrics,
        };
        f(locker, &mut target)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// Reading past end-of-file zero-fills the rest of `buf` and returns
    /// [`VfsError::ShortRead`].
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let file = self.file()?;
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(VfsError::io(
                        IoOp::Read,
                        e,
                        self.context().with_offset(offset),
                    ));
                }
            }
        }
        trace!(offset, len = buf.len(), got = done, "read");
        if done < buf.len() {
            buf[done..].fill(0);
            return Err(VfsError::ShortRead {
                expected: buf.len(),
                actual: done,
                context: self.context().with_offset(offset),
            });
        }
        Ok(())
    }

    /// Write all of `buf` at `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let file = self.file()?;
        let mut done = 0;
        while done < buf.len() {
            match file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(VfsError::Full {
                        context: self.context().with_offset(offset + done as u64),
                    });
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                    return Err(VfsError::Full {
                        context: self.context().with_offset(offset + done as u64),
                    });
                }
                Err(e) => {
                    return Err(VfsError::io(
                        IoOp::Write,
                        e,
                        self.context().with_offset(offset),
                    ));
                }
            }
        }
        self.padded.store(false, Ordering::Relaxed);
        trace!(offset, len = buf.len(), "write");
        Ok(())
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file()?
            .set_len(size)
            .map_err(|e| VfsError::io(IoOp::Truncate, e, self.context().with_offset(size)))?;
        self.padded.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub fn file_size(&self) -> Result<u64> {
        let size = self
            .file()?
            .metadata()
            .map_err(|e| VfsError::io(IoOp::Fstat, e, self.context()))?
            .len();
        // Hide the pad byte written to an empty file at open.
        if size == 1 && self.padded.load(Ordering::Relaxed) {
            return Ok(0);
        }
        Ok(size)
    }

    /// Flush data (and metadata unless `data_only`) to stable storage.
    ///
    /// The first sync after creating a journal also syncs the parent
    /// directory, then closes the directory descriptor. Directory sync
    /// failures are logged and ignored.
    #[instrument(level = "debug", skip(self), fields(path = ?self.path))]
    pub fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let full = flags.mode == SyncMode::Full && self.full_fsync;
        let file = self.file()?;
        let barrier = sync_descriptor(file.as_fd(), full, flags.data_only)
            .map_err(|e| VfsError::io(IoOp::Fsync, e, self.context()))?;
        self.metrics.record_sync();

        if let Some(dir) = self.dir.take() {
            if barrier {
                trace!("Directory entry covered by full barrier");
            } else {
                match sync_descriptor(dir.as_fd(), false, false) {
                    Ok(_) => {
                        self.metrics.record_dir_sync();
                        debug!("Synced parent directory");
                    }
                    Err(e) => warn!(error = %e, "Directory fsync failed, ignoring"),
                }
            }
        }
        Ok(())
    }

    /// Raise the lock to `level`. Never blocks; contention is `Busy`.
    pub fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.with_locker(|locker, target| locker.lock(target, level))
    }

    /// Lower the lock to `level` (NONE or SHARED).
    pub fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.with_locker(|locker, target| locker.unlock(target, level))
    }

    /// Whether any connection holds RESERVED or higher on this file.
    pub fn check_reserved_lock(&mut self) -> Result<bool> {
        self.with_locker(|locker, target| locker.check_reserved_lock(target))
    }

    pub fn lock_level(&self) -> LockLevel {
        self.level
    }

    pub fn lock_style(&self) -> LockStyle {
        self.locker.as_ref().map_or(LockStyle::NoLock, Locker::style)
    }

    pub fn layout(&self) -> LockLayout {
        self.layout
    }

    pub fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    /// Device capability bits. None are claimed.
    pub fn device_characteristics(&self) -> u32 {
        0
    }

    /// Path the handle was opened with. `None` for anonymous temporary files.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Whether a directory descriptor is still waiting for its one sync.
    pub fn has_pending_dir_sync(&self) -> bool {
        self.dir.is_some()
    }

    /// Registry key, for handles using POSIX locking.
    pub fn lock_key(&self) -> Option<LockKey> {
        self.locker.as_ref().and_then(Locker::lock_key)
    }

    /// Device and inode of the open file.
    pub fn file_id(&self) -> Result<FileId> {
        FileId::of(self.file()?)
    }

    /// Close the handle, releasing every lock it holds.
    ///
    /// If another handle in this process still holds a lock on the same
    /// inode, the descriptor is parked instead of closed so that lock
    /// survives.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let unlocked = self.unlock(LockLevel::None);
        self.dir = None;
        let closed = match (self.locker.take(), self.file.take()) {
            (Some(locker), Some(file)) => locker.close(file),
            _ => Ok(()),
        };
        trace!(path = ?self.path, "closed");
        unlocked.and(closed)
    }
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(path = ?self.path, error = %e, "Error closing file handle");
        }
    }
}
