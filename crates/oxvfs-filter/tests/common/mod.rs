//! Shared helpers for oxvfs-filter integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use oxvfs_filter::{FilterChain, FilterContext, FilterStatus, SdchManager};
use url::Url;

pub fn url(s: &str) -> Url {
    Url::parse(s).expect("valid url")
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("gzip write");
    enc.finish().expect("gzip finish")
}

/// `deflate` as servers are supposed to send it: zlib framing.
pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("zlib write");
    enc.finish().expect("zlib finish")
}

/// `deflate` as many servers actually send it: no framing at all.
pub fn raw_deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("deflate write");
    enc.finish().expect("deflate finish")
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    enc.write_all(data).expect("bzip2 write");
    enc.finish().expect("bzip2 finish")
}

/// Decode `body` through a fresh chain for `encodings`.
pub fn decode(
    encodings: &[&str],
    ctx: &FilterContext,
    manager: Option<&Arc<SdchManager>>,
    body: &[u8],
    chunk: usize,
) -> (FilterStatus, Vec<u8>) {
    let mut chain = FilterChain::from_encodings(encodings, ctx, manager)
        .expect("chain builds")
        .expect("chain is not empty");
    chain.decode_all(body, chunk)
}

// ============================================================================
// VCDIFF / SDCH payloads
// ============================================================================

pub fn varint(mut value: u64, out: &mut Vec<u8>) {
    let mut groups = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        groups.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.extend(groups.iter().rev());
}

/// One delta instruction against the dictionary.
pub enum Op<'a> {
    Add(&'a [u8]),
    /// Dictionary offset and length
    Copy(usize, usize),
}

/// Single-window VCDIFF delta with the whole dictionary as source segment.
///
/// Uses ADD and COPY with explicit sizes and `VCD_SELF` addresses only.
pub fn vcdiff_delta(dictionary_len: usize, ops: &[Op<'_>]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut inst = Vec::new();
    let mut addr = Vec::new();
    let mut target_len = 0u64;
    for op in ops {
        match op {
            Op::Add(bytes) => {
                inst.push(1);
                varint(bytes.len() as u64, &mut inst);
                data.extend_from_slice(bytes);
                target_len += bytes.len() as u64;
            }
            Op::Copy(offset, len) => {
                inst.push(19);
                varint(*len as u64, &mut inst);
                varint(*offset as u64, &mut addr);
                target_len += *len as u64;
            }
        }
    }

    let mut body = Vec::new();
    varint(target_len, &mut body);
    body.push(0);
    varint(data.len() as u64, &mut body);
    varint(inst.len() as u64, &mut body);
    varint(addr.len() as u64, &mut body);
    body.extend_from_slice(&data);
    body.extend_from_slice(&inst);
    body.extend_from_slice(&addr);

    let mut delta = vec![0xd6, 0xc3, 0xc4, 0x00, 0x00];
    delta.push(oxvfs_filter::vcdiff::VCD_SOURCE);
    varint(dictionary_len as u64, &mut delta);
    varint(0, &mut delta);
    varint(body.len() as u64, &mut delta);
    delta.extend_from_slice(&body);
    delta
}

/// Dictionary text: header lines, blank line, payload.
pub fn dictionary_text(header: &[&str], payload: &[u8]) -> Vec<u8> {
    let mut text = header.join("\n").into_bytes();
    text.extend_from_slice(b"\n\n");
    text.extend_from_slice(payload);
    text
}

/// SDCH response body: server hash, NUL, delta.
pub fn sdch_body(server_hash: &str, delta: &[u8]) -> Vec<u8> {
    let mut body = server_hash.as_bytes().to_vec();
    body.push(0);
    body.extend_from_slice(delta);
    body
}

pub const DICTIONARY_PAYLOAD: &[u8] =
    b"<html><head><title>Example</title></head><body>shared boilerplate</body></html>";

/// Manager holding one dictionary for `example.com` registered from
/// `dictionary_url`, plus the dictionary's server hash.
pub fn manager_with(header: &[&str], dictionary_url: &str) -> (Arc<SdchManager>, String) {
    let manager = Arc::new(SdchManager::new());
    let text = dictionary_text(header, DICTIONARY_PAYLOAD);
    let hash = manager
        .add_dictionary(&text, &url(dictionary_url))
        .expect("dictionary accepted");
    (manager, hash)
}

/// Target built from the head and tail of the dictionary around `middle`.
pub fn sdch_target(middle: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let dict = DICTIONARY_PAYLOAD;
    let head = 47;
    let tail = dict.len() - 14;
    let delta = vcdiff_delta(
        dict.len(),
        &[Op::Copy(0, head), Op::Add(middle), Op::Copy(tail, dict.len() - tail)],
    );
    let mut expected = dict[..head].to_vec();
    expected.extend_from_slice(middle);
    expected.extend_from_slice(&dict[tail..]);
    (delta, expected)
}
