//! Flushing file contents and directory entries to stable storage.

use std::io;
use std::os::fd::BorrowedFd;

use tracing::trace;

use crate::sys;

/// How hard a sync pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `fsync`/`fdatasync`: data reaches the drive
    #[default]
    Normal,
    /// Full barrier: the drive flushes its own cache too, where supported
    Full,
}

/// Flags for [`crate::UnixFile::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncFlags {
    pub mode: SyncMode,
    /// Skip metadata that is not needed to read the data back.
    pub data_only: bool,
}

impl SyncFlags {
    pub const NORMAL: Self = Self {
        mode: SyncMode::Normal,
        data_only: false,
    };

    pub const FULL: Self = Self {
        mode: SyncMode::Full,
        data_only: false,
    };

    #[must_use]
    pub const fn data_only(mut self) -> Self {
        self.data_only = true;
        self
    }
}

/// True when this platform has a flush stronger than `fsync`.
pub const HAS_FULL_FSYNC: bool = cfg!(target_vendor = "apple");

/// Sync one descriptor.
///
/// Returns whether the full barrier was used, so callers can skip work the
/// barrier already covers.
pub(crate) fn sync_descriptor(
    fd: BorrowedFd<'_>,
    full: bool,
    data_only: bool,
) -> io::Result<bool> {
    #[cfg(target_vendor = "apple")]
    if full {
        match sys::full_fsync(fd) {
            Ok(()) => {
                trace!("F_FULLFSYNC");
                return Ok(true);
            }
            // Some filesystems reject F_FULLFSYNC; fall back.
            Err(e) => trace!(error = %e, "F_FULLFSYNC failed, using fsync"),
        }
    }
    #[cfg(not(target_vendor = "apple"))]
    let _ = full;

    if data_only {
        sys::fdatasync(fd)?;
    } else {
        sys::fsync(fd)?;
    }
    trace!(data_only, "fsync");
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn test_flags() {
        assert_eq!(SyncFlags::default(), SyncFlags::NORMAL);
        let flags = SyncFlags::FULL.data_only();
        assert_eq!(flags.mode, SyncMode::Full);
        assert!(flags.data_only);
    }

    #[test]
    fn test_sync_descriptor() {
        let file = tempfile::tempfile().unwrap();
        let barrier = sync_descriptor(file.as_fd(), false, true).unwrap();
        assert!(!barrier);
        sync_descriptor(file.as_fd(), true, false).unwrap();
    }
}
