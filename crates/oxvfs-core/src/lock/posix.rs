//! fcntl byte-range locking through the process-wide registry.
//!
//! # Kernel lock per level
//!
//! | level     | bytes held                                      |
//! |-----------|-------------------------------------------------|
//! | SHARED    | read lock on one random byte of the SHARED range |
//! | RESERVED  | SHARED + write lock on RESERVED                 |
//! | PENDING   | above + write lock on PENDING                   |
//! | EXCLUSIVE | PENDING + write lock on the whole SHARED range  |
//!
//! The kernel lock belongs to the process, so the registry records the level
//! the process holds and how many local handles share a SHARED acquisition.
//!
//! AFP-style handles run the same machine with `reader` set to a write lock;
//! see [`super::afp`].

use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, instrument, trace};

use super::registry::{FileId, LockKey, LockRegistry, RegistryState};
use super::{LockLevel, LockMethods, LockTarget};
use crate::error::{IoOp, Result, VfsError};
use crate::metrics::LockMetrics;
use crate::sys::{self, RangeLock};

#[derive(Debug)]
pub(crate) struct PosixLocker {
    registry: Arc<LockRegistry>,
    metrics: Arc<LockMetrics>,
    lock_key: LockKey,
    file_id: FileId,
    owner: ThreadId,
    /// Lock kind for the SHARED byte and the PENDING guard taken with it.
    reader: RangeLock,
    padded: bool,
}

impl PosixLocker {
    /// Attach `file` to the registry. Readers take `reader` locks.
    pub fn attach(
        registry: Arc<LockRegistry>,
        metrics: Arc<LockMetrics>,
        file: &File,
        reader: RangeLock,
    ) -> Result<Self> {
        let owner_key = registry.owner_for_current_thread();
        let attached = registry.enter().find_lock_info(file, owner_key)?;
        Ok(Self {
            registry,
            metrics,
            lock_key: attached.key,
            file_id: attached.id,
            owner: thread::current().id(),
            reader,
            padded: attached.padded,
        })
    }

    pub fn lock_key(&self) -> LockKey {
        self.lock_key
    }

    /// Whether attaching wrote the one-byte pad into an empty file.
    pub fn padded(&self) -> bool {
        self.padded
    }

    /// Move the handle to the calling thread on platforms where lock entries
    /// are per thread. A handle holding a lock cannot move.
    fn transfer_ownership(
        &mut self,
        state: &mut RegistryState,
        current: LockLevel,
        threads_override: bool,
    ) -> Result<()> {
        if threads_override {
            return Ok(());
        }
        let me = thread::current().id();
        if self.owner == me {
            return Ok(());
        }
        if current != LockLevel::None {
            return Err(VfsError::misuse(
                "a locked handle cannot be used from another thread",
            ));
        }
        debug!(from = ?self.owner, to = ?me, "Transferring handle ownership");
        self.owner = me;
        state.release_lock_info(&self.lock_key);
        let (key, _) = state.attach(self.file_id, Some(me));
        // attach() bumped the open count again; undo that half.
        if let Some(open) = state.opens.get_mut(&self.file_id) {
            open.n_ref = open.n_ref.saturating_sub(1);
        }
        self.lock_key = key;
        Ok(())
    }

    fn check_owner(&self, threads_override: bool) -> Result<()> {
        if !threads_override && self.owner != thread::current().id() {
            return Err(VfsError::misuse(
                "a locked handle cannot be used from another thread",
            ));
        }
        Ok(())
    }
}

impl LockMethods for PosixLocker {
    #[instrument(level = "debug", skip(self, target), fields(from = %target.level))]
    fn lock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        let current = *target.level;
        if current >= level {
            return Ok(());
        }
        target.validate_request(level)?;

        let threads_override = self.registry.threads_override_locks();
        let registry = Arc::clone(&self.registry);
        let mut state = registry.enter();
        self.transfer_ownership(&mut state, current, threads_override)?;

        let (info, open) = state.entries_mut(&self.lock_key, &self.file_id)?;
        let layout = target.layout;
        let fd = target.file.as_fd();

        // Another handle in this process is past SHARED, or we want more
        // than SHARED while someone else holds a different level.
        if current != info.level && (info.level >= LockLevel::Pending || level > LockLevel::Shared) {
            trace!(process_level = %info.level, "Busy: local conflict");
            return Err(VfsError::Busy);
        }

        // Another local handle already holds SHARED or RESERVED at the OS
        // level: piggyback on it.
        if level == LockLevel::Shared
            && (info.level == LockLevel::Shared || info.level == LockLevel::Reserved)
        {
            debug_assert_eq!(current, LockLevel::None);
            info.cnt += 1;
            open.n_lock += 1;
            *target.level = LockLevel::Shared;
            target.metrics.record_shared_fast_path();
            return Ok(());
        }

        // PENDING guards SHARED acquisition and the climb to EXCLUSIVE.
        if level == LockLevel::Shared
            || (level == LockLevel::Exclusive && current < LockLevel::Pending)
        {
            // SHARED takes PENDING as a reader lock rather than a write
            // lock, so concurrent readers only collide with a PENDING writer.
            let kind = if level == LockLevel::Shared {
                self.reader
            } else {
                RangeLock::Write
            };
            if let Err(e) = sys::set_lock(fd, kind, layout.pending_byte(), 1) {
                return Err(VfsError::from_lock_failure(&e, target.context()));
            }
        }

        let result = if level == LockLevel::Shared {
            debug_assert_eq!(info.cnt, 0);
            debug_assert_eq!(info.level, LockLevel::None);

            let byte = layout.random_shared_byte();
            let acquired = sys::set_lock(fd, self.reader, byte, 1);

            if let Err(e) = sys::set_lock(fd, RangeLock::Unlock, layout.pending_byte(), 1) {
                return Err(VfsError::io(IoOp::Unlock, e, target.context()));
            }

            match acquired {
                Ok(()) => {
                    info.cnt = 1;
                    info.shared_byte = byte;
                    open.n_lock += 1;
                    target.metrics.record_os_lock();
                    Ok(())
                }
                Err(e) => Err(VfsError::from_lock_failure(&e, target.context())),
            }
        } else if level == LockLevel::Exclusive && info.cnt > 1 {
            // Other local handles are reading through our SHARED lock.
            Err(VfsError::Busy)
        } else {
            debug_assert_ne!(current, LockLevel::None);
            let (start, len) = match level {
                LockLevel::Reserved => (layout.reserved_byte(), 1),
                _ => (layout.shared_first(), layout.shared_size()),
            };
            match sys::set_lock(fd, RangeLock::Write, start, len) {
                Ok(()) => {
                    target.metrics.record_os_lock();
                    Ok(())
                }
                Err(e) => Err(VfsError::from_lock_failure(&e, target.context())),
            }
        };

        match result {
            Ok(()) => {
                *target.level = level;
                info.level = level;
            }
            Err(_) if level == LockLevel::Exclusive => {
                // PENDING is held; record it so unlock releases it.
                *target.level = LockLevel::Pending;
                info.level = LockLevel::Pending;
            }
            Err(_) => {}
        }
        trace!(to = %target.level, ok = result.is_ok(), "Lock transition");
        result
    }

    #[instrument(level = "debug", skip(self, target), fields(from = %target.level))]
    fn unlock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        if level > LockLevel::Shared {
            return Err(VfsError::misuse("unlock target must be NONE or SHARED"));
        }
        let current = *target.level;
        if current <= level {
            return Ok(());
        }
        let threads_override = self.registry.threads_override_locks();
        self.check_owner(threads_override)?;

        let registry = Arc::clone(&self.registry);
        let mut state = registry.enter();
        let (info, open) = state.entries_mut(&self.lock_key, &self.file_id)?;
        debug_assert!(info.cnt > 0);

        let layout = target.layout;
        let fd = target.file.as_fd();
        let mut result = Ok(());

        if current > LockLevel::Shared {
            debug_assert_eq!(info.level, current);
            if level == LockLevel::Shared {
                // Re-take our SHARED byte as a reader and drop the rest of
                // the SHARED range, which EXCLUSIVE held as a write lock.
                let byte = info.shared_byte;
                let below = byte - layout.shared_first();
                let above = layout.lock_range_end() - byte - 1;
                let relocked = sys::set_lock(fd, self.reader, byte, 1)
                    .and_then(|()| {
                        if current == LockLevel::Exclusive && below > 0 {
                            sys::set_lock(fd, RangeLock::Unlock, layout.shared_first(), below)
                        } else {
                            Ok(())
                        }
                    })
                    .and_then(|()| {
                        if current == LockLevel::Exclusive && above > 0 {
                            sys::set_lock(fd, RangeLock::Unlock, byte + 1, above)
                        } else {
                            Ok(())
                        }
                    });
                if let Err(e) = relocked {
                    result = Err(VfsError::io(IoOp::Rdlock, e, target.context()));
                }
            }
            match sys::set_lock(fd, RangeLock::Unlock, layout.pending_byte(), 2) {
                Ok(()) => info.level = LockLevel::Shared,
                Err(e) => result = Err(VfsError::io(IoOp::Unlock, e, target.context())),
            }
        }

        if level == LockLevel::None {
            info.cnt = info.cnt.saturating_sub(1);
            if info.cnt == 0 {
                match sys::set_lock(
                    fd,
                    RangeLock::Unlock,
                    layout.pending_byte(),
                    layout.lock_range_len(),
                ) {
                    Ok(()) => info.level = LockLevel::None,
                    Err(e) => result = Err(VfsError::io(IoOp::Unlock, e, target.context())),
                }
            }

            open.n_lock = open.n_lock.saturating_sub(1);
            if open.n_lock == 0 && !open.pending.is_empty() {
                let pending: Vec<OwnedFd> = std::mem::take(&mut open.pending);
                let count = pending.len();
                drop(pending);
                target.metrics.record_deferred_flush(count);
                debug!(count, "Flushed deferred descriptors");
            }
        }

        drop(state);
        *target.level = level;
        result
    }

    fn check_reserved_lock(&mut self, target: &LockTarget<'_>) -> Result<bool> {
        let state = self.registry.enter();
        if let Some(info) = state.lock_info(&self.lock_key)
            && info.level > LockLevel::Shared
        {
            return Ok(true);
        }
        let layout = target.layout;
        sys::conflicting_lock(
            target.file.as_fd(),
            RangeLock::Write,
            layout.reserved_byte(),
            1,
        )
        .map_err(|e| VfsError::io(IoOp::Lock, e, target.context()))
    }

    fn close(self, file: File) -> Result<()> {
        let mut state = self.registry.enter();
        let to_close = match state.opens.get_mut(&self.file_id) {
            Some(open) if open.n_lock > 0 => {
                // Closing now would drop the locks of sibling handles.
                open.pending.push(OwnedFd::from(file));
                self.metrics.record_deferred_close();
                debug!(
                    dev = self.file_id.dev,
                    ino = self.file_id.ino,
                    queued = open.pending.len(),
                    "Deferring close: inode still locked"
                );
                None
            }
            _ => Some(file),
        };
        state.release_lock_info(&self.lock_key);
        state.release_open_count(&self.file_id);
        drop(state);
        drop(to_close);
        Ok(())
    }
}
