//! Process-wide bookkeeping for POSIX advisory locks.
//!
//! `fcntl` locks belong to the process, not to a descriptor: two handles on
//! the same inode share one kernel lock, and closing *any* descriptor on the
//! inode drops every lock the process holds there. The registry virtualizes
//! that state so each handle keeps its own logical lock level.
//!
//! # Tables
//!
//! - [`LockInfo`], keyed by [`LockKey`] (device, inode and, where threads do
//!   not override each other's locks, the owning thread): the lock level the
//!   kernel currently sees for this process, and how many local handles are
//!   sharing a SHARED acquisition.
//! - [`OpenCount`], keyed by [`FileId`] (device, inode): how many handles are
//!   open, how many hold a lock, and the descriptors whose `close()` had to be
//!   deferred because a sibling handle still held a lock.
//!
//! Both tables live behind one mutex so that lock transitions, deferred
//! closes and flushes are atomic with respect to each other.
//!
//! # Global Registry
//!
//! [`LockRegistry::global`] is shared by every VFS built with default
//! settings. Tests and embedders that want isolated bookkeeping construct
//! their own with [`LockRegistry::new`] or
//! [`LockRegistry::with_thread_override`].

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::LockLevel;
use super::probe;
use crate::error::{FileContext, IoOp, Result, VfsError};

static GLOBAL_LOCK_REGISTRY: OnceLock<Arc<LockRegistry>> = OnceLock::new();

/// Device and inode of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

impl FileId {
    /// Identity of an open file from `fstat`.
    pub fn of(file: &File) -> Result<Self> {
        let meta = file
            .metadata()
            .map_err(|e| stat_error(e, FileContext::new()))?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

fn stat_error(source: std::io::Error, context: FileContext) -> VfsError {
    if source.raw_os_error() == Some(libc::EOVERFLOW) {
        VfsError::NoLargeFileSupport { context }
    } else {
        VfsError::io(IoOp::Fstat, source, context)
    }
}

/// Key of a [`LockInfo`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub file: FileId,
    /// Present only where threads cannot override each other's locks.
    pub owner: Option<ThreadId>,
}

/// Lock state the kernel sees for one inode (and thread, where keyed).
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub key: LockKey,
    /// Local handles sharing the current SHARED acquisition
    pub cnt: u32,
    pub level: LockLevel,
    /// Handles attached to this entry
    pub n_ref: u32,
    /// Byte in the SHARED range this process read-locked
    pub shared_byte: u64,
}

impl LockInfo {
    fn new(key: LockKey) -> Self {
        Self {
            key,
            cnt: 0,
            level: LockLevel::None,
            n_ref: 0,
            shared_byte: 0,
        }
    }
}

/// Per-inode open and lock counts plus the deferred-close queue.
#[derive(Debug, Default)]
pub struct OpenCount {
    pub n_ref: u32,
    pub n_lock: u32,
    pub pending: Vec<OwnedFd>,
}

/// The two tables, reachable only while the registry mutex is held.
#[derive(Debug, Default)]
pub struct RegistryState {
    pub(crate) locks: HashMap<LockKey, LockInfo>,
    pub(crate) opens: HashMap<FileId, OpenCount>,
}

/// Result of [`RegistryState::find_lock_info`].
#[derive(Debug, Clone, Copy)]
pub struct Attached {
    pub key: LockKey,
    pub id: FileId,
    /// A pad byte was written into a previously empty file.
    pub padded: bool,
}

impl RegistryState {
    /// Attach a handle on `file` to its entries, creating them on first use.
    ///
    /// On macOS a zero-length file first gets a one-byte pad write: some
    /// filesystems there report unstable inode numbers for empty files.
    pub fn find_lock_info(&mut self, file: &File, owner: Option<ThreadId>) -> Result<Attached> {
        #[cfg(target_vendor = "apple")]
        let padded = write_probe_byte(file)?;
        #[cfg(not(target_vendor = "apple"))]
        let padded = false;

        let id = FileId::of(file)?;
        let (key, id) = self.attach(id, owner);
        Ok(Attached { key, id, padded })
    }

    /// Attach by identity without touching the file.
    pub fn attach(&mut self, id: FileId, owner: Option<ThreadId>) -> (LockKey, FileId) {
        let key = LockKey { file: id, owner };
        self.locks
            .entry(key)
            .or_insert_with(|| {
                debug!(dev = id.dev, ino = id.ino, ?owner, "Created lock entry");
                LockInfo::new(key)
            })
            .n_ref += 1;
        self.opens
            .entry(id)
            .or_insert_with(|| {
                debug!(dev = id.dev, ino = id.ino, "Created open-count entry");
                OpenCount::default()
            })
            .n_ref += 1;
        (key, id)
    }

    /// Drop one handle's reference to a lock entry.
    pub fn release_lock_info(&mut self, key: &LockKey) {
        if let Some(info) = self.locks.get_mut(key) {
            info.n_ref = info.n_ref.saturating_sub(1);
            if info.n_ref == 0 {
                self.locks.remove(key);
                debug!(dev = key.file.dev, ino = key.file.ino, "Destroyed lock entry");
            }
        }
    }

    /// Drop one handle's reference to an open-count entry. Any descriptors
    /// still queued when the entry dies are closed.
    pub fn release_open_count(&mut self, id: &FileId) {
        if let Some(open) = self.opens.get_mut(id) {
            open.n_ref = open.n_ref.saturating_sub(1);
            if open.n_ref == 0
                && let Some(open) = self.opens.remove(id)
            {
                if !open.pending.is_empty() {
                    warn!(
                        count = open.pending.len(),
                        "Closing deferred descriptors with the last handle"
                    );
                }
                debug!(dev = id.dev, ino = id.ino, "Destroyed open-count entry");
            }
        }
    }

    pub fn lock_info(&self, key: &LockKey) -> Option<&LockInfo> {
        self.locks.get(key)
    }

    pub fn open_count(&self, id: &FileId) -> Option<&OpenCount> {
        self.opens.get(id)
    }

    pub fn lock_entries(&self) -> usize {
        self.locks.len()
    }

    pub fn open_entries(&self) -> usize {
        self.opens.len()
    }

    /// Mutable access to both entries of one handle.
    pub(crate) fn entries_mut(
        &mut self,
        key: &LockKey,
        id: &FileId,
    ) -> Result<(&mut LockInfo, &mut OpenCount)> {
        let info = self
            .locks
            .get_mut(key)
            .ok_or(VfsError::misuse("lock entry missing for open handle"))?;
        let open = self
            .opens
            .get_mut(id)
            .ok_or(VfsError::misuse("open-count entry missing for open handle"))?;
        Ok((info, open))
    }
}

#[cfg(target_vendor = "apple")]
fn write_probe_byte(file: &File) -> Result<bool> {
    use std::os::unix::fs::FileExt;

    let meta = file
        .metadata()
        .map_err(|e| stat_error(e, FileContext::new()))?;
    if meta.len() != 0 {
        return Ok(false);
    }
    file.write_at(b"S", 0)
        .map_err(|e| VfsError::io(IoOp::Write, e, FileContext::new().with_offset(0)))?;
    Ok(true)
}

/// Shared lock bookkeeping plus the thread-override capability flag.
#[derive(Debug, Default)]
pub struct LockRegistry {
    state: Mutex<RegistryState>,
    thread_override: OnceLock<bool>,
}

impl LockRegistry {
    /// Create an empty registry. The thread probe runs on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the thread-override capability fixed, skipping
    /// the runtime probe.
    pub fn with_thread_override(threads_override: bool) -> Self {
        let registry = Self::new();
        let _ = registry.thread_override.set(threads_override);
        registry
    }

    /// Get the global registry singleton.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_LOCK_REGISTRY.get_or_init(|| Arc::new(Self::new())))
    }

    /// Whether a lock taken by one thread can be released or overridden by
    /// another. Probed once, then memoized.
    pub fn threads_override_locks(&self) -> bool {
        *self
            .thread_override
            .get_or_init(probe::threads_override_locks)
    }

    /// Owner component of lock keys created for the calling thread.
    pub fn owner_for_current_thread(&self) -> Option<ThreadId> {
        if self.threads_override_locks() {
            None
        } else {
            Some(std::thread::current().id())
        }
    }

    /// Enter the registry critical section.
    pub fn enter(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }
}
