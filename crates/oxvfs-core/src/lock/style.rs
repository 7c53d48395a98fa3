//! Pick a locking strategy for the filesystem a file lives on.

use std::fs::File;
use std::os::fd::AsFd;

use tracing::debug;

use super::{LockLayout, LockStyle};
use crate::sys::{self, RangeLock};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SMB_MAGICS: [u32; 3] = [0xFF53_4D42, 0x517B, 0xFE53_4D42];

/// Detect the locking style for an open file.
///
/// Known filesystem types map directly. Anything else gets an `F_GETLK`
/// probe on the RESERVED byte: if byte-range locks work the answer is
/// [`LockStyle::Posix`], otherwise dot-file locking (or no locking for a
/// read-only handle, which cannot create the lock file).
pub fn detect_lock_style(file: &File, read_only: bool, layout: &LockLayout) -> LockStyle {
    if let Some(style) = style_from_fs_type(file) {
        debug!(%style, "Lock style from filesystem type");
        return style;
    }

    match sys::conflicting_lock(file.as_fd(), RangeLock::Write, layout.reserved_byte(), 1) {
        Ok(_) => LockStyle::Posix,
        Err(e) => {
            let style = if read_only {
                LockStyle::NoLock
            } else {
                LockStyle::DotFile
            };
            debug!(error = %e, %style, "Byte-range lock probe failed");
            style
        }
    }
}

#[cfg(target_vendor = "apple")]
fn style_from_fs_type(file: &File) -> Option<LockStyle> {
    let name = sys::fs_type_name(file.as_fd()).ok()?;
    match name.as_str() {
        "hfs" | "ufs" | "apfs" => Some(LockStyle::Posix),
        "afpfs" => Some(LockStyle::Afp),
        "smbfs" => Some(LockStyle::Flock),
        "msdos" => Some(LockStyle::DotFile),
        "webdav" => Some(LockStyle::NoLock),
        _ => None,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn style_from_fs_type(file: &File) -> Option<LockStyle> {
    let magic = sys::fs_magic(file.as_fd()).ok()? as u32;
    SMB_MAGICS.contains(&magic).then_some(LockStyle::Flock)
}

#[cfg(not(any(target_vendor = "apple", target_os = "linux", target_os = "android")))]
fn style_from_fs_type(_file: &File) -> Option<LockStyle> {
    None
}
