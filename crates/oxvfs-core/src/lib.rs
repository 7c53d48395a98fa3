//! POSIX VFS with storage-engine locking.
//!
//! This crate provides the operating-system layer a page-based storage engine
//! sits on: positional file I/O, durable sync, and the
//! NONE → SHARED → RESERVED → PENDING → EXCLUSIVE lock protocol implemented
//! over advisory locks, with the same on-disk lock byte layout as SQLite.
//!
//! # Locking
//!
//! POSIX `fcntl` locks are owned by the process, and closing any descriptor
//! on an inode drops all of the process's locks on it. The [`LockRegistry`]
//! tracks lock state per inode so several handles in one process can each
//! hold their own logical level. Descriptors closed while a sibling handle
//! still holds a lock are parked until that lock is released.
//!
//! Filesystems without working byte-range locks get a different strategy
//! (`flock`, dot-file, AFP-style, or none). See [`LockStyle`].
//!
//! # Example
//!
//! ```no_run
//! use oxvfs_core::{FileKind, LockLevel, OpenFlags, UnixVfs, Vfs};
//! use std::path::Path;
//!
//! let vfs = UnixVfs::new();
//! let mut db = vfs.open(
//!     Some(Path::new("app.db")),
//!     OpenFlags::READWRITE | OpenFlags::CREATE,
//!     FileKind::MainDb,
//! )?;
//! db.lock(LockLevel::Shared)?;
//! let mut header = [0u8; 100];
//! let _ = db.read_at(&mut header, 0);
//! db.unlock(LockLevel::None)?;
//! db.close()?;
//! # Ok::<(), oxvfs_core::VfsError>(())
//! ```

#![cfg(unix)]

pub mod config;
pub mod error;
pub mod file;
pub mod lock;
pub mod metrics;
pub mod sync;
mod sys;
pub mod vfs;

pub use config::{LockStyleChoice, VfsConfig};
pub use error::{FileContext, IoOp, Result, VfsError, VfsErrorCode};
pub use file::UnixFile;
pub use lock::{FileId, LockLayout, LockLevel, LockRegistry, LockStyle};
pub use metrics::{LockMetrics, LockMetricsSnapshot};
pub use sync::{SyncFlags, SyncMode};
pub use vfs::{AccessMode, FileKind, OpenFlags, UnixVfs, Vfs};
