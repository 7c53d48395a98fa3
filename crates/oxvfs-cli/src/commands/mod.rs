pub mod check;
pub mod decode;
pub mod info;
pub mod lock;
pub mod probe;
pub mod sync;

use std::path::Path;

use anyhow::{Context, Result};

use oxvfs_core::{FileKind, OpenFlags, UnixFile, UnixVfs, Vfs};

/// Open an existing database file, read-write when `write` is set.
pub fn open_db(vfs: &UnixVfs, path: &Path, write: bool) -> Result<UnixFile> {
    let flags = if write {
        OpenFlags::READWRITE
    } else {
        OpenFlags::READONLY
    };
    vfs.open(Some(path), flags, FileKind::MainDb)
        .with_context(|| format!("Failed to open {}", path.display()))
}
