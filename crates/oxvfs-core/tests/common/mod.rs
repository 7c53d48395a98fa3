//! Shared helpers for oxvfs-core integration tests.

#![allow(dead_code)]

use oxvfs_core::{FileKind, LockStyle, OpenFlags, UnixFile, UnixVfs, Vfs, VfsConfig};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A VFS with its own registry, fixed to POSIX locking.
pub fn posix_vfs() -> UnixVfs {
    vfs_with(VfsConfig::default().with_lock_style(LockStyle::Posix))
}

/// A VFS with its own registry, fixed to AFP-style locking.
pub fn afp_vfs() -> UnixVfs {
    vfs_with(VfsConfig::default().with_lock_style(LockStyle::Afp))
}

/// A VFS with its own registry (thread override fixed to `true`).
pub fn vfs_with(config: VfsConfig) -> UnixVfs {
    UnixVfs::with_config(config.with_thread_override(true))
}

/// Scratch directory plus a database path inside it.
pub fn scratch_db() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    (dir, path)
}

pub fn rw_create() -> OpenFlags {
    OpenFlags::READWRITE | OpenFlags::CREATE
}

pub fn open_db(vfs: &UnixVfs, path: &Path) -> UnixFile {
    vfs.open(Some(path), rw_create(), FileKind::MainDb)
        .expect("open database")
}
