//! `bzip2` content decoding.

use bzip2::{Decompress, Status};
use tracing::trace;

use crate::filter::{Filter, FilterStatus, FilterType, StreamBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoding {
    InProgress,
    Done,
    Error,
}

pub struct Bzip2Filter {
    stream: StreamBuffer,
    decoding: Decoding,
    inner: Decompress,
}

impl Bzip2Filter {
    /// `small` selects libbzip2's low-memory decompression mode.
    pub fn new(buffer_size: usize, small: bool) -> Self {
        Self {
            stream: StreamBuffer::new(buffer_size),
            decoding: Decoding::InProgress,
            inner: Decompress::new(small),
        }
    }
}

impl Filter for Bzip2Filter {
    fn filter_type(&self) -> FilterType {
        FilterType::Bzip2
    }

    fn stream(&self) -> &StreamBuffer {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut StreamBuffer {
        &mut self.stream
    }

    fn read_filtered_data(&mut self, dest: &mut [u8]) -> (FilterStatus, usize) {
        if dest.is_empty() {
            return (FilterStatus::Error, 0);
        }
        match self.decoding {
            Decoding::Done => return (FilterStatus::Done, 0),
            Decoding::Error => return (FilterStatus::Error, 0),
            Decoding::InProgress => {}
        }
        if self.stream.is_empty() {
            return (FilterStatus::NeedMoreData, 0);
        }

        let in_before = self.inner.total_in();
        let out_before = self.inner.total_out();
        let result = self.inner.decompress(self.stream.remaining(), dest);
        let used = (self.inner.total_in() - in_before) as usize;
        let produced = (self.inner.total_out() - out_before) as usize;
        self.stream.consume(used);

        match result {
            Ok(Status::StreamEnd) => {
                self.decoding = Decoding::Done;
                (FilterStatus::Done, produced)
            }
            Ok(Status::MemNeeded) | Err(_) => {
                trace!(?result, "bzip2 decode failed");
                self.decoding = Decoding::Error;
                (FilterStatus::Error, 0)
            }
            Ok(_) if self.stream.is_empty() => (FilterStatus::NeedMoreData, produced),
            Ok(_) => (FilterStatus::Ok, produced),
        }
    }
}
