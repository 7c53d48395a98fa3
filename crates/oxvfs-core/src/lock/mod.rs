//! Lock levels and the per-filesystem locking strategies.
//!
//! Every strategy implements the same four operations (lock, unlock,
//! reserved-lock check, close). The strategy for a handle is picked once at
//! open time and stored as a [`Locker`] variant, so dispatch is a `match`
//! rather than a vtable call.

pub(crate) mod afp;
mod dotfile;
mod flock;
mod layout;
mod nolock;
mod posix;
pub mod probe;
pub mod registry;
mod style;

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

pub use layout::{DEFAULT_PENDING_BYTE, DEFAULT_SHARED_SIZE, LayoutError, LockLayout};
pub use registry::{FileId, LockKey, LockRegistry};
pub use style::detect_lock_style;

pub(crate) use dotfile::DotFileLocker;
pub(crate) use flock::FlockLocker;
pub(crate) use nolock::NoLocker;
pub(crate) use posix::PosixLocker;

use crate::error::{FileContext, Result};
use crate::metrics::LockMetrics;

/// Lock levels, weakest first.
///
/// PENDING is never requested directly. It is entered on the way to
/// EXCLUSIVE and blocks new SHARED acquirers while existing readers drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockLevel {
    #[default]
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl LockLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LockLevel::None => "NONE",
            LockLevel::Shared => "SHARED",
            LockLevel::Reserved => "RESERVED",
            LockLevel::Pending => "PENDING",
            LockLevel::Exclusive => "EXCLUSIVE",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
}

impl FromStr for LockLevel {
    type Err = ParseNameError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(LockLevel::None),
            "shared" => Ok(LockLevel::Shared),
            "reserved" => Ok(LockLevel::Reserved),
            "pending" => Ok(LockLevel::Pending),
            "exclusive" => Ok(LockLevel::Exclusive),
            _ => Err(ParseNameError {
                kind: "lock level",
                value: s.to_string(),
            }),
        }
    }
}

/// Locking strategy in effect for an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockStyle {
    /// fcntl byte-range locks through the process-wide registry
    Posix,
    /// Whole-file `flock()`, exclusive only
    Flock,
    /// `<path>.lock` presence means someone holds the file
    DotFile,
    /// Exclusive-only byte ranges with a random SHARED byte
    Afp,
    /// Levels are tracked but nothing is locked
    NoLock,
}

impl LockStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            LockStyle::Posix => "posix",
            LockStyle::Flock => "flock",
            LockStyle::DotFile => "dotfile",
            LockStyle::Afp => "afp",
            LockStyle::NoLock => "none",
        }
    }
}

impl fmt::Display for LockStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockStyle {
    type Err = ParseNameError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "posix" | "fcntl" => Ok(LockStyle::Posix),
            "flock" => Ok(LockStyle::Flock),
            "dotfile" | "dot-file" | "dotlock" => Ok(LockStyle::DotFile),
            "afp" => Ok(LockStyle::Afp),
            "none" | "nolock" => Ok(LockStyle::NoLock),
            _ => Err(ParseNameError {
                kind: "lock style",
                value: s.to_string(),
            }),
        }
    }
}

/// What a strategy needs from the handle for one call.
pub(crate) struct LockTarget<'a> {
    pub file: &'a File,
    pub path: Option<&'a Path>,
    /// The handle's recorded level. Strategies update it in place.
    pub level: &'a mut LockLevel,
    pub layout: LockLayout,
    pub metrics: &'a LockMetrics,
}

impl LockTarget<'_> {
    pub fn context(&self) -> FileContext {
        let ctx = FileContext::new().with_lock_level(*self.level);
        match self.path {
            Some(path) => ctx.with_path(path),
            None => ctx,
        }
    }

    /// Enforce the protocol order shared by every strategy.
    pub fn validate_request(&self, level: LockLevel) -> Result<()> {
        let current = *self.level;
        if level == LockLevel::Pending {
            return Err(crate::VfsError::misuse("PENDING cannot be requested directly"));
        }
        if current == LockLevel::None && level != LockLevel::Shared {
            return Err(crate::VfsError::misuse("the first lock taken must be SHARED"));
        }
        if level == LockLevel::Reserved && current != LockLevel::Shared {
            return Err(crate::VfsError::misuse("RESERVED requires SHARED"));
        }
        Ok(())
    }
}

/// Operations every locking strategy provides.
pub(crate) trait LockMethods {
    fn lock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()>;

    /// Lower the lock to `level`, which is NONE or SHARED.
    fn unlock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()>;

    fn check_reserved_lock(&mut self, target: &LockTarget<'_>) -> Result<bool>;

    /// Dispose of the descriptor. The handle is already unlocked.
    fn close(self, file: File) -> Result<()>;
}

/// Strategy chosen for a handle at open time.
#[derive(Debug)]
pub(crate) enum Locker {
    Posix(PosixLocker),
    Flock(FlockLocker),
    DotFile(DotFileLocker),
    Afp(PosixLocker),
    NoLock(NoLocker),
}

impl Locker {
    pub fn style(&self) -> LockStyle {
        match self {
            Locker::Posix(_) => LockStyle::Posix,
            Locker::Flock(_) => LockStyle::Flock,
            Locker::DotFile(_) => LockStyle::DotFile,
            Locker::Afp(_) => LockStyle::Afp,
            Locker::NoLock(_) => LockStyle::NoLock,
        }
    }

    /// Registry key for handles attached to the registry (POSIX and AFP).
    pub fn lock_key(&self) -> Option<LockKey> {
        match self {
            Locker::Posix(l) | Locker::Afp(l) => Some(l.lock_key()),
            _ => None,
        }
    }

    /// Whether opening wrote a pad byte into an empty file.
    pub fn padded(&self) -> bool {
        match self {
            Locker::Posix(l) | Locker::Afp(l) => l.padded(),
            _ => false,
        }
    }

    pub fn lock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        let result = match self {
            Locker::Posix(l) => l.lock(target, level),
            Locker::Flock(l) => l.lock(target, level),
            Locker::DotFile(l) => l.lock(target, level),
            Locker::Afp(l) => l.lock(target, level),
            Locker::NoLock(l) => l.lock(target, level),
        };
        if matches!(result, Err(ref e) if e.is_busy()) {
            target.metrics.record_busy();
        }
        result
    }

    pub fn unlock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        let before = *target.level;
        let result = match self {
            Locker::Posix(l) => l.unlock(target, level),
            Locker::Flock(l) => l.unlock(target, level),
            Locker::DotFile(l) => l.unlock(target, level),
            Locker::Afp(l) => l.unlock(target, level),
            Locker::NoLock(l) => l.unlock(target, level),
        };
        if *target.level != before {
            target.metrics.record_unlock();
        }
        result
    }

    pub fn check_reserved_lock(&mut self, target: &LockTarget<'_>) -> Result<bool> {
        match self {
            Locker::Posix(l) => l.check_reserved_lock(target),
            Locker::Flock(l) => l.check_reserved_lock(target),
            Locker::DotFile(l) => l.check_reserved_lock(target),
            Locker::Afp(l) => l.check_reserved_lock(target),
            Locker::NoLock(l) => l.check_reserved_lock(target),
        }
    }

    pub fn close(self, file: File) -> Result<()> {
        match self {
            Locker::Posix(l) => l.close(file),
            Locker::Flock(l) => l.close(file),
            Locker::DotFile(l) => l.close(file),
            Locker::Afp(l) => l.close(file),
            Locker::NoLock(l) => l.close(file),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn test_level_parse_and_display() {
        for level in [
            LockLevel::None,
            LockLevel::Shared,
            LockLevel::Reserved,
            LockLevel::Pending,
            LockLevel::Exclusive,
        ] {
            assert_eq!(level.to_string().parse::<LockLevel>(), Ok(level));
        }
        assert!("upgradable".parse::<LockLevel>().is_err());
    }

    #[test]
    fn test_style_aliases() {
        assert_eq!("fcntl".parse::<LockStyle>(), Ok(LockStyle::Posix));
        assert_eq!("dot-file".parse::<LockStyle>(), Ok(LockStyle::DotFile));
        assert_eq!("NoLock".parse::<LockStyle>(), Ok(LockStyle::NoLock));
        let err = "nfs".parse::<LockStyle>().unwrap_err();
        assert_eq!(err.to_string(), "unknown lock style 'nfs'");
    }
}
