//! Lock byte coordinates.

use thiserror::Error;

/// Offset of the PENDING byte in files written by SQLite (1 GiB).
pub const DEFAULT_PENDING_BYTE: u64 = 0x4000_0000;

/// Number of bytes in the SHARED range.
pub const DEFAULT_SHARED_SIZE: u64 = 510;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("shared range must span at least 2 bytes, got {0}")]
    SharedRangeTooSmall(u64),
    #[error("lock range starting at {pending_byte:#x} overflows the file offset space")]
    Overflow { pending_byte: u64 },
}

/// Where the lock bytes live in the file.
///
/// None of these offsets hold data. They are coordinates for `fcntl`
/// byte-range locks: PENDING, RESERVED immediately after it, then the SHARED
/// range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockLayout {
    pending_byte: u64,
    shared_size: u64,
}

impl LockLayout {
    pub fn new(pending_byte: u64, shared_size: u64) -> Result<Self, LayoutError> {
        if shared_size < 2 {
            return Err(LayoutError::SharedRangeTooSmall(shared_size));
        }
        let end = pending_byte
            .checked_add(2)
            .and_then(|first| first.checked_add(shared_size))
            .ok_or(LayoutError::Overflow { pending_byte })?;
        if end > i64::MAX as u64 {
            return Err(LayoutError::Overflow { pending_byte });
        }
        Ok(Self {
            pending_byte,
            shared_size,
        })
    }

    #[inline]
    pub fn pending_byte(&self) -> u64 {
        self.pending_byte
    }

    #[inline]
    pub fn reserved_byte(&self) -> u64 {
        self.pending_byte + 1
    }

    #[inline]
    pub fn shared_first(&self) -> u64 {
        self.pending_byte + 2
    }

    #[inline]
    pub fn shared_size(&self) -> u64 {
        self.shared_size
    }

    /// One past the last lock byte.
    #[inline]
    pub fn lock_range_end(&self) -> u64 {
        self.shared_first() + self.shared_size
    }

    /// Length of `[pending_byte, lock_range_end)`.
    #[inline]
    pub fn lock_range_len(&self) -> u64 {
        self.lock_range_end() - self.pending_byte
    }

    /// Pick a SHARED byte. Never the first byte of the range.
    pub(crate) fn random_shared_byte(&self) -> u64 {
        use rand::Rng;
        self.shared_first() + rand::rng().random_range(1..self.shared_size)
    }
}

impl Default for LockLayout {
    fn default() -> Self {
        Self {
            pending_byte: DEFAULT_PENDING_BYTE,
            shared_size: DEFAULT_SHARED_SIZE,
        }
    }
}
