//! VFS configuration.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::lock::{LockLayout, LockStyle, ParseNameError};

/// Environment variable naming an extra temporary directory, searched first.
pub const TEMP_DIR_ENV: &str = "OXVFS_TEMP_DIR";

/// How a handle's locking strategy is chosen at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStyleChoice {
    /// Detect from the filesystem the file lives on
    #[default]
    Auto,
    Posix,
    Flock,
    DotFile,
    Afp,
    NoLock,
}

impl LockStyleChoice {
    /// The fixed style, or `None` for [`LockStyleChoice::Auto`].
    pub fn fixed(self) -> Option<LockStyle> {
        match self {
            LockStyleChoice::Auto => None,
            LockStyleChoice::Posix => Some(LockStyle::Posix),
            LockStyleChoice::Flock => Some(LockStyle::Flock),
            LockStyleChoice::DotFile => Some(LockStyle::DotFile),
            LockStyleChoice::Afp => Some(LockStyle::Afp),
            LockStyleChoice::NoLock => Some(LockStyle::NoLock),
        }
    }
}

impl From<LockStyle> for LockStyleChoice {
    fn from(style: LockStyle) -> Self {
        match style {
            LockStyle::Posix => LockStyleChoice::Posix,
            LockStyle::Flock => LockStyleChoice::Flock,
            LockStyle::DotFile => LockStyleChoice::DotFile,
            LockStyle::Afp => LockStyleChoice::Afp,
            LockStyle::NoLock => LockStyleChoice::NoLock,
        }
    }
}

impl FromStr for LockStyleChoice {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(LockStyleChoice::Auto);
        }
        s.parse::<LockStyle>().map(Self::from)
    }
}

impl fmt::Display for LockStyleChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fixed() {
            Some(style) => style.fmt(f),
            None => f.write_str("auto"),
        }
    }
}

/// Configuration for a [`crate::UnixVfs`].
///
/// Defaults are compatible with files written by SQLite: the standard lock
/// byte layout, auto-detected lock style, directory sync on journal
/// creation, and the full-barrier flush where the platform has one.
#[derive(Debug, Clone)]
pub struct VfsConfig {
    /// Lock byte coordinates.
    pub layout: LockLayout,

    /// Lock strategy selection.
    pub lock_style: LockStyleChoice,

    /// Fixes the thread-override capability instead of probing it.
    ///
    /// Only consulted when the VFS builds its own registry.
    pub thread_override: Option<bool>,

    /// Sync the parent directory after creating a main or master journal.
    pub dir_sync: bool,

    /// Use `F_FULLFSYNC` for FULL syncs where available.
    pub full_fsync: bool,

    /// Candidate directories for temporary files, searched in order.
    pub temp_dirs: Vec<PathBuf>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            layout: LockLayout::default(),
            lock_style: LockStyleChoice::Auto,
            thread_override: None,
            dir_sync: true,
            full_fsync: true,
            temp_dirs: default_temp_dirs(),
        }
    }
}

impl VfsConfig {
    #[must_use]
    pub fn with_layout(mut self, layout: LockLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn with_lock_style(mut self, lock_style: impl Into<LockStyleChoice>) -> Self {
        self.lock_style = lock_style.into();
        self
    }

    #[must_use]
    pub fn with_thread_override(mut self, threads_override: bool) -> Self {
        self.thread_override = Some(threads_override);
        self
    }

    #[must_use]
    pub fn with_dir_sync(mut self, dir_sync: bool) -> Self {
        self.dir_sync = dir_sync;
        self
    }

    #[must_use]
    pub fn with_full_fsync(mut self, full_fsync: bool) -> Self {
        self.full_fsync = full_fsync;
        self
    }

    #[must_use]
    pub fn with_temp_dirs(mut self, temp_dirs: Vec<PathBuf>) -> Self {
        self.temp_dirs = temp_dirs;
        self
    }
}

/// `$OXVFS_TEMP_DIR`, then the usual Unix locations, then the current directory.
pub fn default_temp_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::with_capacity(5);
    if let Some(dir) = env::var_os(TEMP_DIR_ENV).filter(|d| !d.is_empty()) {
        dirs.push(PathBuf::from(dir));
    }
    dirs.extend(["/var/tmp", "/usr/tmp", "/tmp", "."].map(PathBuf::from));
    dirs
}
