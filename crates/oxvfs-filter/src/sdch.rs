//! SDCH decoding: a server hash selecting a dictionary, then a VCDIFF delta
//! against that dictionary.

use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::dictionary::{SERVER_HASH_LEN, SdchManager};
use crate::filter::{Filter, FilterStatus, FilterType, StreamBuffer};
use crate::vcdiff::VcdiffDecoder;

/// Server hash plus its NUL terminator.
const SERVER_ID_LEN: usize = SERVER_HASH_LEN + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoding {
    WaitingForDictionary,
    InProgress,
    PassThrough,
    Error,
}

pub struct SdchFilter {
    stream: StreamBuffer,
    kind: FilterType,
    manager: Arc<SdchManager>,
    url: Url,
    response_code: Option<u16>,
    possible_pass_through: bool,
    decoding: Decoding,
    server_id: Vec<u8>,
    hash_is_plausible: bool,
    decoder: Option<VcdiffDecoder>,
    /// Decoded bytes that did not fit the caller's buffer
    excess: Vec<u8>,
    excess_pos: usize,
}

impl SdchFilter {
    /// `kind` is [`FilterType::Sdch`] or [`FilterType::SdchPossible`].
    pub fn new(
        kind: FilterType,
        buffer_size: usize,
        manager: Arc<SdchManager>,
        url: Url,
        response_code: Option<u16>,
    ) -> Self {
        Self {
            stream: StreamBuffer::new(buffer_size),
            kind,
            manager,
            url,
            response_code,
            possible_pass_through: kind == FilterType::SdchPossible,
            decoding: Decoding::WaitingForDictionary,
            server_id: Vec::with_capacity(SERVER_ID_LEN),
            hash_is_plausible: false,
            decoder: None,
            excess: Vec::new(),
            excess_pos: 0,
        }
    }

    fn initialize_dictionary(&mut self) -> FilterStatus {
        if self.stream.is_empty() {
            return FilterStatus::NeedMoreData;
        }
        let needed = SERVER_ID_LEN - self.server_id.len();
        let take = needed.min(self.stream.len());
        self.server_id
            .extend_from_slice(&self.stream.remaining()[..take]);
        self.stream.consume(take);
        if self.server_id.len() < SERVER_ID_LEN {
            return FilterStatus::NeedMoreData;
        }

        let (hash, terminator) = self.server_id.split_at(SERVER_HASH_LEN);
        self.hash_is_plausible = terminator == [0]
            && hash
                .iter()
                .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

        let dictionary = if self.hash_is_plausible {
            std::str::from_utf8(hash)
                .ok()
                .and_then(|hash| self.manager.get_dictionary(hash, &self.url))
        } else {
            None
        };

        match dictionary {
            Some(dictionary) => {
                debug!(server_hash = dictionary.server_hash(), url = %self.url, "SDCH dictionary selected");
                self.decoder = Some(VcdiffDecoder::new(dictionary.payload()));
                self.decoding = Decoding::InProgress;
                FilterStatus::Ok
            }
            None => {
                debug!(
                    plausible = self.hash_is_plausible,
                    url = %self.url,
                    "no usable SDCH dictionary for response"
                );
                self.decoding = Decoding::Error;
                FilterStatus::Error
            }
        }
    }

    /// Decide whether a response without a usable dictionary can still be
    /// delivered unmodified.
    fn recover(&mut self) -> bool {
        if self.response_code == Some(404) {
            debug!(url = %self.url, "passing through SDCH 404 body");
        } else if self.possible_pass_through && !self.hash_is_plausible {
            debug!(url = %self.url, "content is not SDCH, passing through");
        } else {
            warn!(url = %self.url, "SDCH decoding impossible, blacklisting domain");
            self.manager.blacklist_domain(&self.url);
            return false;
        }
        self.decoding = Decoding::PassThrough;
        // The bytes read as a server id are content
        self.excess = std::mem::take(&mut self.server_id);
        self.excess_pos = 0;
        true
    }

    fn output_excess(&mut self, dest: &mut [u8]) -> usize {
        let pending = &self.excess[self.excess_pos..];
        let n = pending.len().min(dest.len());
        dest[..n].copy_from_slice(&pending[..n]);
        self.excess_pos += n;
        if self.excess_pos == self.excess.len() {
            self.excess.clear();
            self.excess_pos = 0;
        }
        n
    }
}

impl Filter for SdchFilter {
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
            Decoding::Error => return (FilterStatus::Error, 0),
            Decoding::WaitingForDictionary => match self.initialize_dictionary() {
                FilterStatus::NeedMoreData => return (FilterStatus::NeedMoreData, 0),
                FilterStatus::Error if !self.recover() => return (FilterStatus::Error, 0),
                _ => {}
            },
            Decoding::InProgress | Decoding::PassThrough => {}
        }

        let mut written = self.output_excess(dest);
        if written == dest.len() {
            return (FilterStatus::Ok, written);
        }

        if self.decoding == Decoding::PassThrough {
            let (status, n) = self.stream.copy_out(&mut dest[written..]);
            return (status, written + n);
        }

        if self.stream.is_empty() {
            return (FilterStatus::NeedMoreData, written);
        }
        let Some(decoder) = self.decoder.as_mut() else {
            self.decoding = Decoding::Error;
            return (FilterStatus::Error, 0);
        };
        let result = decoder.decode_chunk(self.stream.remaining(), &mut self.excess);
        self.stream.clear();
        if let Err(err) = result {
            warn!(error = %err, url = %self.url, "SDCH delta is corrupt");
            self.decoder = None;
            self.decoding = Decoding::Error;
            self.manager.blacklist_domain(&self.url);
            return (FilterStatus::Error, 0);
        }

        written += self.output_excess(&mut dest[written..]);
        if written == dest.len() && !self.excess.is_empty() {
            (FilterStatus::Ok, written)
        } else {
            (FilterStatus::NeedMoreData, written)
        }
    }
}
