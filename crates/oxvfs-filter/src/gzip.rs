//! Gzip and deflate decoding over `flate2`'s raw inflater.

use flate2::{Decompress, FlushDecompress, Status};
use tracing::{debug, trace};

use crate::filter::{Filter, FilterStatus, FilterType, StreamBuffer};

const GZIP_FOOTER_SIZE: usize = 8;

/// Input kept while a zlib-wrapped stream has produced nothing yet, so it
/// can be replayed as raw deflate.
const RAW_RETRY_WINDOW: usize = 64;

const FLAG_HCRC: u8 = 0x02;
const FLAG_EXTRA: u8 = 0x04;
const FLAG_NAME: u8 = 0x08;
const FLAG_COMMENT: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderStep {
    Id1,
    Id2,
    Method,
    Flags,
    /// MTIME, XFL and OS
    Fixed(u8),
    ExtraLenLo,
    ExtraLenHi(u8),
    Extra(u16),
    Name,
    Comment,
    Crc(u8),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderRead {
    Incomplete,
    /// Header finished after this many bytes of the input
    Complete(usize),
    Invalid,
}

/// Incremental RFC 1952 member header parser.
#[derive(Debug)]
struct GzipHeader {
    step: HeaderStep,
    flags: u8,
}

impl GzipHeader {
    fn new() -> Self {
        Self {
            step: HeaderStep::Id1,
            flags: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.step == HeaderStep::Complete
    }

    fn read_more(&mut self, input: &[u8]) -> HeaderRead {
        if self.is_complete() {
            return HeaderRead::Complete(0);
        }
        for (i, &b) in input.iter().enumerate() {
            self.step = match self.step {
                HeaderStep::Id1 if b == 0x1f => HeaderStep::Id2,
                HeaderStep::Id2 if b == 0x8b => HeaderStep::Method,
                HeaderStep::Method if b == 8 => HeaderStep::Flags,
                HeaderStep::Id1 | HeaderStep::Id2 | HeaderStep::Method => {
                    return HeaderRead::Invalid;
                }
                HeaderStep::Flags => {
                    self.flags = b;
                    HeaderStep::Fixed(6)
                }
                HeaderStep::Fixed(1) => self.after_fixed(),
                HeaderStep::Fixed(n) => HeaderStep::Fixed(n - 1),
                HeaderStep::ExtraLenLo => HeaderStep::ExtraLenHi(b),
                HeaderStep::ExtraLenHi(lo) => match u16::from_le_bytes([lo, b]) {
                    0 => self.after_extra(),
                    len => HeaderStep::Extra(len),
                },
                HeaderStep::Extra(1) => self.after_extra(),
                HeaderStep::Extra(n) => HeaderStep::Extra(n - 1),
                HeaderStep::Name if b == 0 => self.after_name(),
                HeaderStep::Comment if b == 0 => self.after_comment(),
                step @ (HeaderStep::Name | HeaderStep::Comment) => step,
                HeaderStep::Crc(1) | HeaderStep::Complete => HeaderStep::Complete,
                HeaderStep::Crc(n) => HeaderStep::Crc(n - 1),
            };
            if self.is_complete() {
                return HeaderRead::Complete(i + 1);
            }
        }
        HeaderRead::Incomplete
    }

    fn after_fixed(&self) -> HeaderStep {
        if self.flags & FLAG_EXTRA != 0 {
            HeaderStep::ExtraLenLo
        } else {
            self.after_extra()
        }
    }

    fn after_extra(&self) -> HeaderStep {
        if self.flags & FLAG_NAME != 0 {
            HeaderStep::Name
        } else {
            self.after_name()
        }
    }

    fn after_name(&self) -> HeaderStep {
        if self.flags & FLAG_COMMENT != 0 {
            HeaderStep::Comment
        } else {
            self.after_comment()
        }
    }

    fn after_comment(&self) -> HeaderStep {
        if self.flags & FLAG_HCRC != 0 {
            HeaderStep::Crc(2)
        } else {
            HeaderStep::Complete
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoding {
    InProgress,
    Done,
    Error,
}

/// Raw-deflate fallback bookkeeping for the `deflate` encoding.
#[derive(Debug)]
enum RawRetry {
    /// zlib decoding with no output yet; consumed input is remembered
    Watching(Vec<u8>),
    /// Switched to raw deflate; these bytes are decoded before the stream
    Replaying(Vec<u8>),
    Spent,
}

/// Decoder for the `gzip` and `deflate` content encodings.
pub struct GzipFilter {
    stream: StreamBuffer,
    kind: FilterType,
    header: Option<GzipHeader>,
    header_invalid: bool,
    possible_sdch_pass_through: bool,
    decoding: Decoding,
    inflater: Decompress,
    footer_bytes: usize,
    retry: RawRetry,
}

impl GzipFilter {
    /// Build a decoder for `kind`, which must be one of the gzip or deflate
    /// filter types.
    pub fn new(kind: FilterType, buffer_size: usize) -> Self {
        let gzip = matches!(kind, FilterType::Gzip | FilterType::GzipHelpingSdch);
        Self {
            stream: StreamBuffer::new(buffer_size),
            kind,
            header: gzip.then(GzipHeader::new),
            header_invalid: false,
            possible_sdch_pass_through: kind == FilterType::GzipHelpingSdch,
            decoding: Decoding::InProgress,
            inflater: Decompress::new(!gzip),
            footer_bytes: 0,
            retry: if gzip {
                RawRetry::Spent
            } else {
                RawRetry::Watching(Vec::new())
            },
        }
    }

    fn is_gzip(&self) -> bool {
        self.header.is_some()
    }

    fn check_header(&mut self) -> FilterStatus {
        let Some(header) = self.header.as_mut() else {
            return FilterStatus::Ok;
        };
        if header.is_complete() {
            return FilterStatus::Ok;
        }
        if self.stream.is_empty() {
            return FilterStatus::NeedMoreData;
        }
        match header.read_more(self.stream.remaining()) {
            HeaderRead::Incomplete => {
                self.stream.clear();
                FilterStatus::NeedMoreData
            }
            HeaderRead::Complete(used) => {
                self.stream.consume(used);
                trace!(header_bytes = used, "gzip header parsed");
                if self.stream.is_empty() {
                    FilterStatus::NeedMoreData
                } else {
                    FilterStatus::Ok
                }
            }
            HeaderRead::Invalid => {
                self.header_invalid = true;
                FilterStatus::Error
            }
        }
    }

    fn skip_footer(&mut self) {
        if !self.is_gzip() || self.header_invalid {
            return;
        }
        let wanted = GZIP_FOOTER_SIZE - self.footer_bytes;
        if wanted > 0 {
            let n = wanted.min(self.stream.len());
            self.stream.consume(n);
            self.footer_bytes += n;
        }
    }

    /// Bytes left after the end of the compressed stream are passed on as-is.
    fn copy_trailing(&mut self, dest: &mut [u8]) -> (FilterStatus, usize) {
        let mut written = 0;
        if let RawRetry::Replaying(replay) = &mut self.retry {
            written = dest.len().min(replay.len());
            dest[..written].copy_from_slice(&replay[..written]);
            replay.drain(..written);
            if !replay.is_empty() {
                return (FilterStatus::Ok, written);
            }
        }
        let (status, n) = self.stream.copy_out(&mut dest[written..]);
        (status, written + n)
    }

    fn inflate(&mut self, dest: &mut [u8]) -> (FilterStatus, usize) {
        let mut written = 0;

        if let RawRetry::Replaying(replay) = &mut self.retry
            && !replay.is_empty()
        {
            match inflate_step(&mut self.inflater, replay, dest) {
                Err(e) => {
                    debug!(error = %e, "raw deflate retry failed");
                    return (FilterStatus::Error, 0);
                }
                Ok((status, used, produced)) => {
                    replay.drain(..used);
                    written = produced;
                    if status == Status::StreamEnd {
                        return (FilterStatus::Done, written);
                    }
                    if !replay.is_empty() || written == dest.len() {
                        return (FilterStatus::Ok, written);
                    }
                }
            }
        }

        if self.stream.is_empty() {
            return (FilterStatus::NeedMoreData, written);
        }

        let out = &mut dest[written..];
        match inflate_step(&mut self.inflater, self.stream.remaining(), out) {
            Err(e) => {
                trace!(error = %e, kind = %self.kind, "inflate failed");
                (FilterStatus::Error, written)
            }
            Ok((status, used, produced)) => {
                self.remember_consumed(used);
                self.stream.consume(used);
                written += produced;
                match status {
                    Status::StreamEnd => {
                        self.skip_footer();
                        (FilterStatus::Done, written)
                    }
                    Status::BufError => {
                        // No progress is possible with this input
                        self.stream.clear();
                        (FilterStatus::NeedMoreData, written)
                    }
                    Status::Ok if self.stream.is_empty() => (FilterStatus::NeedMoreData, written),
                    Status::Ok => (FilterStatus::Ok, written),
                }
            }
        }
    }

    fn remember_consumed(&mut self, used: usize) {
        if let RawRetry::Watching(seen) = &mut self.retry {
            if self.inflater.total_out() > 0 || seen.len() + used > RAW_RETRY_WINDOW {
                self.retry = RawRetry::Spent;
            } else {
                seen.extend_from_slice(&self.stream.remaining()[..used]);
            }
        }
    }

    /// Restart as raw deflate for servers that omit the zlib wrapper.
    fn begin_raw_retry(&mut self) -> bool {
        match std::mem::replace(&mut self.retry, RawRetry::Spent) {
            RawRetry::Watching(seen) if self.inflater.total_out() == 0 => {
                debug!(replayed = seen.len(), "deflate stream lacks zlib header, retrying raw");
                self.inflater = Decompress::new(false);
                self.retry = RawRetry::Replaying(seen);
                true
            }
            _ => false,
        }
    }
}

fn inflate_step(
    inflater: &mut Decompress,
    input: &[u8],
    output: &mut [u8],
) -> Result<(Status, usize, usize), flate2::DecompressError> {
    let in_before = inflater.total_in();
    let out_before = inflater.total_out();
    let status = inflater.decompress(input, output, FlushDecompress::None)?;
    let used = (inflater.total_in() - in_before) as usize;
    let produced = (inflater.total_out() - out_before) as usize;
    Ok((status, used, produced))
}

impl Filter for GzipFilter {
    fn filter_type(&self) -> FilterType {
        self.kind
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
            Decoding::Done => {
                self.skip_footer();
                return self.copy_trailing(dest);
            }
            Decoding::Error => return (FilterStatus::Error, 0),
            Decoding::InProgress => {}
        }

        match self.check_header() {
            FilterStatus::NeedMoreData => {
                // A partial gzip header cannot be SDCH, which starts with
                // printable characters.
                self.possible_sdch_pass_through = false;
                return (FilterStatus::NeedMoreData, 0);
            }
            FilterStatus::Error => {
                if self.possible_sdch_pass_through {
                    debug!("no gzip header, passing content through");
                    self.decoding = Decoding::Done;
                    return self.stream.copy_out(dest);
                }
                self.decoding = Decoding::Error;
                return (FilterStatus::Error, 0);
            }
            _ => {}
        }

        let mut result = self.inflate(dest);
        if result.0 == FilterStatus::Error && self.begin_raw_retry() {
            result = self.inflate(dest);
        }
        match result.0 {
            FilterStatus::Done => self.decoding = Decoding::Done,
            FilterStatus::Error => self.decoding = Decoding::Error,
            _ => {}
        }
        result
    }
}
