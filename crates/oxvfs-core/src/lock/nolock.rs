//! Lock-free strategy for read-only or lockless filesystems.

use std::fs::File;

use super::{LockLevel, LockMethods, LockTarget};
use crate::error::{Result, VfsError};

/// Records levels without taking any lock. Concurrent writers are not
/// detected.
#[derive(Debug, Default)]
pub(crate) struct NoLocker;

impl LockMethods for NoLocker {
    fn lock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        if *target.level >= level {
            return Ok(());
        }
        target.validate_request(level)?;
        *target.level = level;
        Ok(())
    }

    fn unlock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        if level > LockLevel::Shared {
            return Err(VfsError::misuse("unlock target must be NONE or SHARED"));
        }
        if *target.level > level {
            *target.level = level;
        }
        Ok(())
    }

    fn check_reserved_lock(&mut self, _target: &LockTarget<'_>) -> Result<bool> {
        Ok(false)
    }

    fn close(self, file: File) -> Result<()> {
        drop(file);
        Ok(())
    }
}
