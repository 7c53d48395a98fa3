//! AFP-style locking: exclusive byte ranges only.
//!
//! Network filesystems of the AFP family cannot share a byte between
//! readers, so each reader takes a write lock on its own random byte of the
//! SHARED range, and the PENDING guard taken with it is a write lock too.
//! EXCLUSIVE write-locks the whole range over the top.
//!
//! The kernel locks still belong to the process, so AFP handles attach to
//! the registry and run the POSIX state machine. Sibling handles in one
//! process arbitrate through the shared lock entry, and closing a sibling
//! while the inode is locked defers the descriptor close.

use std::fs::File;
use std::sync::Arc;

use super::PosixLocker;
use super::registry::LockRegistry;
use crate::error::Result;
use crate::metrics::LockMetrics;
use crate::sys::RangeLock;

/// Attach `file` to the registry with exclusive-only reader locks.
pub(crate) fn attach(
    registry: Arc<LockRegistry>,
    metrics: Arc<LockMetrics>,
    file: &File,
) -> Result<PosixLocker> {
    PosixLocker::attach(registry, metrics, file, RangeLock::Write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockLayout, LockLevel, LockMethods, LockTarget};

    #[test]
    fn test_full_climb_and_release() {
        let file = tempfile::tempfile().unwrap();
        let registry = Arc::new(LockRegistry::with_thread_override(true));
        let metrics = Arc::new(LockMetrics::new());
        let mut locker = attach(Arc::clone(&registry), Arc::clone(&metrics), &file).unwrap();
        let mut level = LockLevel::None;
        let mut target = LockTarget {
            file: &file,
            path: None,
            level: &mut level,
            layout: LockLayout::new(4096, 16).unwrap(),
            metrics: &metrics,
        };

        locker.lock(&mut target, LockLevel::Shared).unwrap();
        locker.lock(&mut target, LockLevel::Reserved).unwrap();
        locker.lock(&mut target, LockLevel::Exclusive).unwrap();
        assert_eq!(*target.level, LockLevel::Exclusive);
        assert!(locker.check_reserved_lock(&target).unwrap());

        locker.unlock(&mut target, LockLevel::Shared).unwrap();
        assert_eq!(*target.level, LockLevel::Shared);
        locker.unlock(&mut target, LockLevel::None).unwrap();
        assert_eq!(level, LockLevel::None);
        assert_eq!(metrics.snapshot().os_lock_acquisitions, 3);

        let key = locker.lock_key();
        assert_eq!(registry.enter().lock_info(&key).unwrap().level, LockLevel::None);
        locker.close(file).unwrap();
        assert_eq!(registry.enter().lock_entries(), 0);
    }
}
