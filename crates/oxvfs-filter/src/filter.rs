//! The pull protocol shared by every decoding stage.
//!
//! A stage owns a [`StreamBuffer`]. Whoever feeds the stage writes raw bytes
//! into [`StreamBuffer::stream_buffer_mut`], commits them with
//! [`StreamBuffer::flush`], and then pulls decoded output with
//! [`Filter::read_filtered_data`]. The buffer cannot be refilled until the
//! stage has consumed everything previously flushed into it.

use std::fmt;

/// Default staging buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Result of one pull from a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterStatus {
    /// Output was produced and the stage still holds input.
    Ok,
    /// The stage consumed all of its input. Output may still be present.
    NeedMoreData,
    /// The encoded stream ended. Terminal.
    Done,
    /// Malformed input. Terminal.
    Error,
}

impl FilterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterStatus::Ok => "ok",
            FilterStatus::NeedMoreData => "need-more-data",
            FilterStatus::Done => "done",
            FilterStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FilterStatus::Done | FilterStatus::Error)
    }
}

impl fmt::Display for FilterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoder kinds a chain can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    Deflate,
    Gzip,
    /// Gzip that turns into a pass-through when the header is not gzip.
    GzipHelpingSdch,
    Bzip2,
    Sdch,
    /// SDCH that passes input through when it does not start with a
    /// plausible dictionary hash.
    SdchPossible,
    Unsupported,
}

impl FilterType {
    /// Map a `Content-Encoding` token to a decoder kind.
    pub fn from_encoding(name: &str) -> Self {
        let name = name.trim();
        if name.eq_ignore_ascii_case("deflate") {
            FilterType::Deflate
        } else if name.eq_ignore_ascii_case("gzip") || name.eq_ignore_ascii_case("x-gzip") {
            FilterType::Gzip
        } else if name.eq_ignore_ascii_case("bzip2") || name.eq_ignore_ascii_case("x-bzip2") {
            FilterType::Bzip2
        } else if name.eq_ignore_ascii_case("sdch") {
            FilterType::Sdch
        } else {
            FilterType::Unsupported
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterType::Deflate => "deflate",
            FilterType::Gzip => "gzip",
            FilterType::GzipHelpingSdch => "gzip-helping-sdch",
            FilterType::Bzip2 => "bzip2",
            FilterType::Sdch => "sdch",
            FilterType::SdchPossible => "sdch-possible",
            FilterType::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-capacity staging buffer with a read cursor.
pub struct StreamBuffer {
    data: Box<[u8]>,
    start: usize,
    len: usize,
}

impl StreamBuffer {
    /// Allocate a buffer. A zero capacity is raised to one byte.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Writable region for the next batch of input.
    ///
    /// Only meaningful while the buffer is drained; [`flush`](Self::flush)
    /// rejects a commit otherwise.
    pub fn stream_buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Commit `n` freshly written bytes as pending input.
    ///
    /// Returns false without touching any state when `n` is zero, exceeds
    /// the capacity, or earlier input has not been consumed yet.
    pub fn flush(&mut self, n: usize) -> bool {
        if n == 0 || n > self.data.len() || self.len != 0 {
            return false;
        }
        self.start = 0;
        self.len = n;
        true
    }

    /// Unconsumed input.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark `n` bytes of pending input as used.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.start += n;
        self.len -= n;
        if self.len == 0 {
            self.start = 0;
        }
    }

    /// Drop all pending input.
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Copy pending input straight to `dest`.
    pub fn copy_out(&mut self, dest: &mut [u8]) -> (FilterStatus, usize) {
        if self.len == 0 {
            return (FilterStatus::NeedMoreData, 0);
        }
        let n = dest.len().min(self.len);
        dest[..n].copy_from_slice(&self.remaining()[..n]);
        self.consume(n);
        if self.len == 0 {
            (FilterStatus::NeedMoreData, n)
        } else {
            (FilterStatus::Ok, n)
        }
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("capacity", &self.data.len())
            .field("pending", &self.len)
            .finish()
    }
}

/// One decoding stage.
pub trait Filter: Send {
    fn filter_type(&self) -> FilterType;

    fn stream(&self) -> &StreamBuffer;

    fn stream_mut(&mut self) -> &mut StreamBuffer;

    /// Decode pending input into `dest`, returning the status and the number
    /// of bytes written. An empty `dest` is a caller error.
    fn read_filtered_data(&mut self, dest: &mut [u8]) -> (FilterStatus, usize);
}
