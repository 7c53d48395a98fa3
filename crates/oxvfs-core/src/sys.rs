//! Thin wrappers over the libc calls std does not expose.
//!
//! Each wrapper returns `io::Result` and retries `EINTR`; the callers map
//! failures onto [`crate::VfsError`].

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::trace;

/// Kind of byte-range lock for `fcntl(F_SETLK)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeLock {
    Read,
    Write,
    Unlock,
}

impl RangeLock {
    fn as_raw(self) -> libc::c_short {
        let raw = match self {
            RangeLock::Read => libc::F_RDLCK,
            RangeLock::Write => libc::F_WRLCK,
            RangeLock::Unlock => libc::F_UNLCK,
        };
        raw as libc::c_short
    }
}

fn flock_request(kind: RangeLock, start: u64, len: u64) -> libc::flock {
    // SAFETY: libc::flock is plain old data; all-zero is a valid value and
    // the fields that matter are set below.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = kind.as_raw();
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = start as libc::off_t;
    lock.l_len = len as libc::off_t;
    lock
}

fn retry_eintr(mut f: impl FnMut() -> libc::c_int) -> io::Result<()> {
    loop {
        if f() == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Non-blocking byte-range lock (`F_SETLK`).
pub(crate) fn set_lock(fd: BorrowedFd<'_>, kind: RangeLock, start: u64, len: u64) -> io::Result<()> {
    let request = flock_request(kind, start, len);
    let result = retry_eintr(|| {
        // SAFETY: fd is open for the lifetime of the borrow and `request`
        // outlives the call.
        unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETLK, std::ptr::from_ref(&request)) }
    });
    trace!(fd = fd.as_raw_fd(), ?kind, start, len, ok = result.is_ok(), "fcntl F_SETLK");
    result
}

/// True if another process holds a lock that conflicts with `kind` over the
/// range (`F_GETLK`). Locks held by this process never conflict.
pub(crate) fn conflicting_lock(
    fd: BorrowedFd<'_>,
    kind: RangeLock,
    start: u64,
    len: u64,
) -> io::Result<bool> {
    let mut request = flock_request(kind, start, len);
    retry_eintr(|| {
        // SAFETY: fd is open for the lifetime of the borrow and `request` is
        // a valid, writable flock.
        unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETLK, std::ptr::from_mut(&mut request)) }
    })?;
    let held = request.l_type != libc::F_UNLCK as libc::c_short;
    trace!(fd = fd.as_raw_fd(), start, len, held, "fcntl F_GETLK");
    Ok(held)
}

/// Whole-file `flock()`; `op` is `LOCK_EX|LOCK_NB`, `LOCK_UN`, ...
pub(crate) fn flock(fd: BorrowedFd<'_>, op: libc::c_int) -> io::Result<()> {
    let result = retry_eintr(|| {
        // SAFETY: fd is open for the lifetime of the borrow.
        unsafe { libc::flock(fd.as_raw_fd(), op) }
    });
    trace!(fd = fd.as_raw_fd(), op, ok = result.is_ok(), "flock");
    result
}

pub(crate) fn fsync(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: fd is open for the lifetime of the borrow.
    retry_eintr(|| unsafe { libc::fsync(fd.as_raw_fd()) })
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn fdatasync(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: fd is open for the lifetime of the borrow.
    retry_eintr(|| unsafe { libc::fdatasync(fd.as_raw_fd()) })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn fdatasync(fd: BorrowedFd<'_>) -> io::Result<()> {
    fsync(fd)
}

/// Ask the drive to flush its cache (`F_FULLFSYNC`).
#[cfg(target_vendor = "apple")]
pub(crate) fn full_fsync(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: fd is open for the lifetime of the borrow.
    retry_eintr(|| unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_FULLFSYNC, 0) })
}

/// `access(2)`. Returns `Ok(false)` when the check fails with a permission
/// or existence error.
pub(crate) fn access(path: &Path, mode: libc::c_int) -> io::Result<bool> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: cpath is a valid NUL-terminated string.
    let rc = unsafe { libc::access(cpath.as_ptr(), mode) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOENT | libc::EACCES | libc::EROFS | libc::ENOTDIR | libc::EPERM) => Ok(false),
        _ => Err(err),
    }
}

/// Filesystem type name from `fstatfs` (`f_fstypename`).
#[cfg(target_vendor = "apple")]
pub(crate) fn fs_type_name(fd: BorrowedFd<'_>) -> io::Result<String> {
    // SAFETY: statfs is plain old data.
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    // SAFETY: fd is open and buf is writable.
    retry_eintr(|| unsafe { libc::fstatfs(fd.as_raw_fd(), &raw mut buf) })?;
    let name: Vec<u8> = buf
        .f_fstypename
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    Ok(String::from_utf8_lossy(&name).into_owned())
}

/// Filesystem magic number from `fstatfs` (`f_type`).
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn fs_magic(fd: BorrowedFd<'_>) -> io::Result<i64> {
    // SAFETY: statfs is plain old data.
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    // SAFETY: fd is open and buf is writable.
    retry_eintr(|| unsafe { libc::fstatfs(fd.as_raw_fd(), &raw mut buf) })?;
    #[allow(clippy::unnecessary_cast)]
    Ok(buf.f_type as i64)
}
