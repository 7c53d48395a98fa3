//! Whole-file `flock()` locking for filesystems without byte-range locks.
//!
//! `flock` only offers one useful mode here, so every level from SHARED up
//! is an exclusive hold on the whole file. Readers in other processes are
//! shut out while any lock is held.

use std::fs::File;
use std::os::fd::AsFd;

use tracing::{instrument, trace};

use super::{LockLevel, LockMethods, LockTarget};
use crate::error::{IoOp, Result, VfsError};
use crate::sys;

#[derive(Debug, Default)]
pub(crate) struct FlockLocker;

impl LockMethods for FlockLocker {
    #[instrument(level = "debug", skip(self, target), fields(from = %target.level))]
    fn lock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        if *target.level >= level {
            return Ok(());
        }
        target.validate_request(level)?;

        if *target.level > LockLevel::None {
            // Already hold the file exclusively; just record the level.
            *target.level = level;
            return Ok(());
        }

        match sys::flock(target.file.as_fd(), libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                target.metrics.record_os_lock();
                *target.level = level;
                Ok(())
            }
            Err(e) => {
                trace!(error = %e, "flock busy");
                Err(VfsError::from_lock_failure(&e, target.context()))
            }
        }
    }

    fn unlock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        if level > LockLevel::Shared {
            return Err(VfsError::misuse("unlock target must be NONE or SHARED"));
        }
        if *target.level <= level {
            return Ok(());
        }
        if level == LockLevel::Shared {
            *target.level = level;
            return Ok(());
        }
        sys::flock(target.file.as_fd(), libc::LOCK_UN)
            .map_err(|e| VfsError::io(IoOp::Unlock, e, target.context()))?;
        *target.level = LockLevel::None;
        Ok(())
    }

    fn check_reserved_lock(&mut self, target: &LockTarget<'_>) -> Result<bool> {
        if *target.level > LockLevel::None {
            // Our own exclusive flock; probing it would release it.
            return Ok(*target.level >= LockLevel::Reserved);
        }
        let fd = target.file.as_fd();
        match sys::flock(fd, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                sys::flock(fd, libc::LOCK_UN)
                    .map_err(|e| VfsError::io(IoOp::Unlock, e, target.context()))?;
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }

    fn close(self, file: File) -> Result<()> {
        drop(file);
        Ok(())
    }
}
