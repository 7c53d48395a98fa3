//! Error types for the VFS layer.
//!
//! Every fallible operation returns [`VfsError`]. Callers that need the
//! storage-engine classification (retry on `Busy`, abort on everything else)
//! use [`VfsError::code`], which maps each error onto [`VfsErrorCode`].

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockLevel;

/// Context for file operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    /// Path of the file (absent for anonymous temporary files)
    pub path: Option<PathBuf>,
    /// Lock level held when the error occurred
    pub lock_level: Option<LockLevel>,
    /// Byte offset involved in the failing call
    pub offset: Option<u64>,
}

impl FileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_lock_level(mut self, level: LockLevel) -> Self {
        self.lock_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for FileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref path) = self.path {
            parts.push(format!("file {}", path.display()));
        }
        if let Some(level) = self.lock_level {
            parts.push(format!("holding {level}"));
        }
        if let Some(offset) = self.offset {
            parts.push(format!("offset {offset}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// The system call (or syscall family) behind an [`VfsError::Io`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Fsync,
    DirFsync,
    Truncate,
    Fstat,
    Unlock,
    Rdlock,
    Lock,
    Delete,
    Access,
    Close,
}

impl IoOp {
    pub fn as_str(self) -> &'static str {
        match self {
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::Fsync => "fsync",
            IoOp::DirFsync => "directory fsync",
            IoOp::Truncate => "truncate",
            IoOp::Fstat => "fstat",
            IoOp::Unlock => "unlock",
            IoOp::Rdlock => "read lock",
            IoOp::Lock => "lock probe",
            IoOp::Delete => "delete",
            IoOp::Access => "access",
            IoOp::Close => "close",
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum VfsError {
    /// Another connection holds a conflicting lock. Retryable.
    #[error("database is locked")]
    Busy,

    /// The caller broke the locking or ownership contract.
    #[error("library routine called out of sequence: {reason}")]
    Misuse { reason: &'static str },

    /// The filesystem rejected a lock offset beyond its large-file limit.
    #[error("large file support is unavailable for {context}")]
    NoLargeFileSupport { context: FileContext },

    #[error("unable to open {context}: {source}")]
    CantOpen {
        #[source]
        source: io::Error,
        context: FileContext,
    },

    #[error("out of memory")]
    NoMem,

    #[error("disk full writing {context}")]
    Full { context: FileContext },

    /// A read hit end-of-file. The unread tail of the buffer was zero-filled.
    #[error("short read on {context}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        expected: usize,
        actual: usize,
        context: FileContext,
    },

    #[error("{op} failed for {context}: {source}")]
    Io {
        op: IoOp,
        #[source]
        source: io::Error,
        context: FileContext,
    },
}

impl VfsError {
    #[must_use]
    pub fn misuse(reason: &'static str) -> Self {
        VfsError::Misuse { reason }
    }

    #[must_use]
    pub fn io(op: IoOp, source: io::Error, context: FileContext) -> Self {
        VfsError::Io {
            op,
            source,
            context,
        }
    }

    /// Classify a failed lock system call: `EINVAL` means the offset is not
    /// addressable on this filesystem, anything else is contention.
    #[must_use]
    pub fn from_lock_failure(source: &io::Error, context: FileContext) -> Self {
        if source.raw_os_error() == Some(libc::EINVAL) {
            VfsError::NoLargeFileSupport { context }
        } else {
            VfsError::Busy
        }
    }

    /// Map to the storage-engine result code.
    pub fn code(&self) -> VfsErrorCode {
        match self {
            VfsError::Busy => VfsErrorCode::Busy,
            VfsError::Misuse { .. } => VfsErrorCode::Misuse,
            VfsError::NoLargeFileSupport { .. } => VfsErrorCode::NoLargeFileSupport,
            VfsError::CantOpen { .. } => VfsErrorCode::CantOpen,
            VfsError::NoMem => VfsErrorCode::NoMem,
            VfsError::Full { .. } => VfsErrorCode::Full,
            VfsError::ShortRead { .. } => VfsErrorCode::IoErrShortRead,
            VfsError::Io { op, .. } => match op {
                IoOp::Read => VfsErrorCode::IoErrRead,
                IoOp::Write => VfsErrorCode::IoErrWrite,
                IoOp::Fsync => VfsErrorCode::IoErrFsync,
                IoOp::DirFsync => VfsErrorCode::IoErrDirFsync,
                IoOp::Truncate => VfsErrorCode::IoErrTruncate,
                IoOp::Fstat => VfsErrorCode::IoErrFstat,
                IoOp::Unlock => VfsErrorCode::IoErrUnlock,
                IoOp::Rdlock => VfsErrorCode::IoErrRdlock,
                IoOp::Lock => VfsErrorCode::IoErrLock,
                IoOp::Delete => VfsErrorCode::IoErrDelete,
                IoOp::Access => VfsErrorCode::IoErrAccess,
                IoOp::Close => VfsErrorCode::IoErrClose,
            },
        }
    }

    /// True only for lock contention.
    pub fn is_busy(&self) -> bool {
        matches!(self, VfsError::Busy)
    }
}

/// Result code taxonomy seen by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsErrorCode {
    Busy,
    Misuse,
    NoLargeFileSupport,
    CantOpen,
    NoMem,
    Full,
    IoErrRead,
    IoErrShortRead,
    IoErrWrite,
    IoErrFsync,
    IoErrDirFsync,
    IoErrTruncate,
    IoErrFstat,
    IoErrUnlock,
    IoErrRdlock,
    IoErrLock,
    IoErrDelete,
    IoErrAccess,
    IoErrClose,
}

impl VfsErrorCode {
    /// Busy is the only condition a transaction layer may retry.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Converts this code to a POSIX errno value.
    pub fn to_errno(self) -> i32 {
        match self {
            Self::Busy => libc::EBUSY,
            Self::Misuse => libc::EINVAL,
            Self::NoLargeFileSupport => libc::EFBIG,
            Self::CantOpen => libc::ENOENT,
            Self::NoMem => libc::ENOMEM,
            Self::Full => libc::ENOSPC,
            _ => libc::EIO,
        }
    }

    /// Returns a human-readable name for this code.
    pub fn name(self) -> &'static str {
        match self {
            Self::Busy => "Busy",
            Self::Misuse => "Misuse",
            Self::NoLargeFileSupport => "NoLargeFileSupport",
            Self::CantOpen => "CantOpen",
            Self::NoMem => "NoMem",
            Self::Full => "Full",
            Self::IoErrRead => "IoErrRead",
            Self::IoErrShortRead => "IoErrShortRead",
            Self::IoErrWrite => "IoErrWrite",
            Self::IoErrFsync => "IoErrFsync",
            Self::IoErrDirFsync => "IoErrDirFsync",
            Self::IoErrTruncate => "IoErrTruncate",
            Self::IoErrFstat => "IoErrFstat",
            Self::IoErrUnlock => "IoErrUnlock",
            Self::IoErrRdlock => "IoErrRdlock",
            Self::IoErrLock => "IoErrLock",
            Self::IoErrDelete => "IoErrDelete",
            Self::IoErrAccess => "IoErrAccess",
            Self::IoErrClose => "IoErrClose",
        }
    }
}

impl fmt::Display for VfsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type Result<T, E = VfsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(VfsError::Busy.code().is_retryable());
        assert!(!VfsError::misuse("x").code().is_retryable());
        let err = VfsError::io(
            IoOp::Fsync,
            io::Error::from_raw_os_error(libc::EIO),
            FileContext::new(),
        );
        assert_eq!(err.code(), VfsErrorCode::IoErrFsync);
        assert!(!err.code().is_retryable());
    }

    #[test]
    fn test_lock_failure_classification() {
        let einval = io::Error::from_raw_os_error(libc::EINVAL);
        assert!(matches!(
            VfsError::from_lock_failure(&einval, FileContext::new()),
            VfsError::NoLargeFileSupport { .. }
        ));

        let eagain = io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(VfsError::from_lock_failure(&eagain, FileContext::new()).is_busy());
    }

    #[test]
    fn test_context_display() {
        let ctx = FileContext::new()
            .with_path("/tmp/db")
            .with_lock_level(LockLevel::Shared)
            .with_offset(42);
        assert_eq!(ctx.to_string(), "file /tmp/db, holding SHARED, offset 42");
        assert_eq!(FileContext::new().to_string(), "(no context)");
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VfsErrorCode::Busy.to_errno(), libc::EBUSY);
        assert_eq!(VfsErrorCode::Full.to_errno(), libc::ENOSPC);
        assert_eq!(VfsErrorCode::IoErrUnlock.to_errno(), libc::EIO);
    }
}
