//! Streaming VCDIFF (RFC 3284) decoder.
//!
//! Supports the default code table, `VCD_SOURCE` and `VCD_TARGET` windows,
//! the Adler-32 window checksum extension, and the interleaved section
//! layout used by SDCH servers (data and address sections empty, everything
//! carried in the instruction section). Secondary compressors and custom
//! code tables are rejected.
//!
//! Input may arrive in arbitrary pieces. A window is decoded once all of its
//! bytes are buffered, so output does not depend on how the input was split.

use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::trace;

pub const VCD_SOURCE: u8 = 0x01;
pub const VCD_TARGET: u8 = 0x02;
pub const VCD_ADLER32: u8 = 0x04;

const MAGIC: [u8; 3] = [0xd6, 0xc3, 0xc4];
const HEADER_SIZE: usize = 5;
const SDCH_VERSION: u8 = b'S';

/// Largest target window accepted.
pub const MAX_TARGET_WINDOW: usize = 64 << 20;

const NEAR_CACHE: usize = 4;
const SAME_CACHE: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VcdiffError {
    #[error("not a VCDIFF stream")]
    BadMagic,

    #[error("unsupported VCDIFF version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("secondary compression and custom code tables are not supported (header indicator {0:#04x})")]
    UnsupportedHeader(u8),

    #[error("invalid window indicator {0:#04x}")]
    BadWindowIndicator(u8),

    #[error("compressed window sections are not supported (delta indicator {0:#04x})")]
    CompressedSections(u8),

    #[error("integer does not fit in 64 bits")]
    VarintOverflow,

    #[error("window of {0} bytes exceeds the limit")]
    WindowTooLarge(u64),

    #[error("source segment {position}+{length} is outside the {available} available bytes")]
    SourceOutOfRange {
        position: u64,
        length: u64,
        available: usize,
    },

    #[error("section lengths do not match the delta encoding length")]
    SectionLengthMismatch,

    #[error("{0} section exhausted")]
    SectionExhausted(&'static str),

    #[error("COPY address {addr} is not before the current position {here}")]
    BadAddress { addr: u64, here: u64 },

    #[error("invalid address mode {0}")]
    BadMode(u8),

    #[error("instructions overflow the target window")]
    TargetOverflow,

    #[error("window decoded to {actual} bytes, header declared {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("window checksum {actual:#010x} does not match {expected:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("{0} section has unused bytes")]
    TrailingSectionData(&'static str),
}

type Result<T, E = VcdiffError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Inst {
    #[default]
    Noop,
    Add,
    Run,
    Copy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Half {
    inst: Inst,
    /// 0 means the size follows in the instruction section
    size: u8,
    mode: u8,
}

impl Half {
    const fn new(inst: Inst, size: u8, mode: u8) -> Self {
        Self { inst, size, mode }
    }
}

type CodeTable = [[Half; 2]; 256];

/// RFC 3284 section 5.6.
fn default_code_table() -> &'static CodeTable {
    static TABLE: OnceLock<CodeTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [[Half::default(); 2]; 256];
        let mut i = 0;
        table[i][0] = Half::new(Inst::Run, 0, 0);
        i += 1;
        for size in 0..=17 {
            table[i][0] = Half::new(Inst::Add, size, 0);
            i += 1;
        }
        for mode in 0..=8 {
            table[i][0] = Half::new(Inst::Copy, 0, mode);
            i += 1;
            for size in 4..=18 {
                table[i][0] = Half::new(Inst::Copy, size, mode);
                i += 1;
            }
        }
        for mode in 0..=5 {
            for add in 1..=4 {
                for copy in 4..=6 {
                    table[i] = [Half::new(Inst::Add, add, 0), Half::new(Inst::Copy, copy, mode)];
                    i += 1;
                }
            }
        }
        for mode in 6..=8 {
            for add in 1..=4 {
                table[i] = [Half::new(Inst::Add, add, 0), Half::new(Inst::Copy, 4, mode)];
                i += 1;
            }
        }
        for mode in 0..=8 {
            table[i] = [Half::new(Inst::Copy, 4, mode), Half::new(Inst::Add, 1, 0)];
            i += 1;
        }
        debug_assert_eq!(i, 256);
        table
    })
}

/// Read a big-endian base-128 integer. `Ok(None)` means more bytes are needed.
fn read_varint(buf: &[u8], pos: &mut usize) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    let mut i = *pos;
    loop {
        let Some(&b) = buf.get(i) else {
            return Ok(None);
        };
        i += 1;
        if value >> 57 != 0 {
            return Err(VcdiffError::VarintOverflow);
        }
        value = (value << 7) | u64::from(b & 0x7f);
        if b & 0x80 == 0 {
            *pos = i;
            return Ok(Some(value));
        }
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| VcdiffError::WindowTooLarge(value))
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in data.chunks(5552) {
        for &x in chunk {
            a += u32::from(x);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// A fully buffered window section.
struct Section<'a> {
    name: &'static str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Section<'a> {
    fn new(name: &'static str, data: &'a [u8]) -> Self {
        Self { name, data, pos: 0 }
    }

    fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(VcdiffError::SectionExhausted(self.name))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64> {
        read_varint(self.data, &mut self.pos)?.ok_or(VcdiffError::SectionExhausted(self.name))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(VcdiffError::SectionExhausted(self.name))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Instruction, data and address sections of one window. In the
/// interleaved layout the latter two read from the instruction section.
struct Sections<'a> {
    inst: Section<'a>,
    data: Option<Section<'a>>,
    addr: Option<Section<'a>>,
}

impl<'a> Sections<'a> {
    fn data(&mut self) -> &mut Section<'a> {
        match &mut self.data {
            Some(section) => section,
            None => &mut self.inst,
        }
    }

    fn addr(&mut self) -> &mut Section<'a> {
        match &mut self.addr {
            Some(section) => section,
            None => &mut self.inst,
        }
    }
}

/// RFC 3284 section 5.3 address cache.
struct AddressCache {
    near: [u64; NEAR_CACHE],
    next_slot: usize,
    same: Vec<u64>,
}

impl AddressCache {
    fn new() -> Self {
        Self {
            near: [0; NEAR_CACHE],
            next_slot: 0,
            same: vec![0; SAME_CACHE * 256],
        }
    }

    fn decode(&mut self, here: u64, mode: u8, section: &mut Section<'_>) -> Result<u64> {
        let m = usize::from(mode);
        let addr = match m {
            0 => section.varint()?,
            1 => {
                let offset = section.varint()?;
                here.checked_sub(offset).ok_or(VcdiffError::BadAddress {
                    addr: offset,
                    here,
                })?
            }
            _ if m < 2 + NEAR_CACHE => self.near[m - 2]
                .checked_add(section.varint()?)
                .ok_or(VcdiffError::VarintOverflow)?,
            _ if m < 2 + NEAR_CACHE + SAME_CACHE => {
                let b = usize::from(section.byte()?);
                self.same[(m - 2 - NEAR_CACHE) * 256 + b]
            }
            _ => return Err(VcdiffError::BadMode(mode)),
        };
        if addr >= here {
            return Err(VcdiffError::BadAddress { addr, here });
        }
        self.near[self.next_slot] = addr;
        self.next_slot = (self.next_slot + 1) % NEAR_CACHE;
        self.same[(addr % (SAME_CACHE as u64 * 256)) as usize] = addr;
        Ok(addr)
    }
}

#[derive(Debug, Clone, Copy)]
struct SourceSegment {
    from_target: bool,
    length: u64,
    position: u64,
}

/// Incremental decoder for one VCDIFF delta file.
pub struct VcdiffDecoder {
    dictionary: Arc<[u8]>,
    pending: Vec<u8>,
    header_seen: bool,
    /// Everything decoded so far, addressable by `VCD_TARGET` windows
    history: Vec<u8>,
    failed: Option<VcdiffError>,
}

impl VcdiffDecoder {
    pub fn new(dictionary: Arc<[u8]>) -> Self {
        Self {
            dictionary,
            pending: Vec::new(),
            header_seen: false,
            history: Vec::new(),
            failed: None,
        }
    }

    /// Bytes buffered waiting for the rest of a header or window.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Feed `data`, appending every completed window to `out`.
    ///
    /// After an error the decoder keeps returning that error.
    pub fn decode_chunk(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let result = self.decode_pending(data, out);
        if let Err(err) = &result {
            trace!(error = %err, "vcdiff decode failed");
            self.failed = Some(err.clone());
        }
        result
    }

    fn decode_pending(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(data);
        let mut pos = 0;

        if !self.header_seen {
            if buf.len() < HEADER_SIZE {
                if !MAGIC.starts_with(&buf[..buf.len().min(MAGIC.len())]) {
                    return Err(VcdiffError::BadMagic);
                }
                self.pending = buf;
                return Ok(());
            }
            parse_header(&buf[..HEADER_SIZE])?;
            self.header_seen = true;
            pos = HEADER_SIZE;
        }

        while pos < buf.len() {
            match self.decode_window(&buf[pos..], out)? {
                Some(used) => pos += used,
                None => break,
            }
        }
        buf.drain(..pos);
        self.pending = buf;
        Ok(())
    }

    /// Decode one window if it is complete, returning the bytes it spans.
    fn decode_window(&mut self, buf: &[u8], out: &mut Vec<u8>) -> Result<Option<usize>> {
        let mut p = 0;
        let indicator = buf[p];
        p += 1;
        if indicator & !(VCD_SOURCE | VCD_TARGET | VCD_ADLER32) != 0
            || indicator & (VCD_SOURCE | VCD_TARGET) == VCD_SOURCE | VCD_TARGET
        {
            return Err(VcdiffError::BadWindowIndicator(indicator));
        }

        let source = if indicator & (VCD_SOURCE | VCD_TARGET) != 0 {
            let Some(length) = read_varint(buf, &mut p)? else {
                return Ok(None);
            };
            let Some(position) = read_varint(buf, &mut p)? else {
                return Ok(None);
            };
            Some(SourceSegment {
                from_target: indicator & VCD_TARGET != 0,
                length,
                position,
            })
        } else {
            None
        };

        let Some(delta_len) = read_varint(buf, &mut p)? else {
            return Ok(None);
        };
        if delta_len > (2 * MAX_TARGET_WINDOW) as u64 {
            return Err(VcdiffError::WindowTooLarge(delta_len));
        }
        let delta_len = to_usize(delta_len)?;
        if buf.len() - p < delta_len {
            return Ok(None);
        }

        let window = self.apply_window(indicator, source, &buf[p..p + delta_len])?;
        trace!(
            target_len = window.len(),
            delta_len,
            from_target = source.is_some_and(|s| s.from_target),
            "vcdiff window decoded"
        );
        out.extend_from_slice(&window);
        self.history.extend_from_slice(&window);
        Ok(Some(p + delta_len))
    }

    fn source_bytes(&self, source: Option<SourceSegment>) -> Result<&[u8]> {
        let Some(seg) = source else {
            return Ok(&[]);
        };
        let base: &[u8] = if seg.from_target {
            &self.history
        } else {
            &self.dictionary
        };
        let out_of_range = || VcdiffError::SourceOutOfRange {
            position: seg.position,
            length: seg.length,
            available: base.len(),
        };
        let end = seg.position.checked_add(seg.length).ok_or_else(out_of_range)?;
        if end > base.len() as u64 {
            return Err(out_of_range());
        }
        Ok(&base[seg.position as usize..end as usize])
    }

    fn apply_window(
        &self,
        indicator: u8,
        source: Option<SourceSegment>,
        delta: &[u8],
    ) -> Result<Vec<u8>> {
        let source = self.source_bytes(source)?;

        let mut c = 0;
        let mut field = || -> Result<u64> {
            read_varint(delta, &mut c)?.ok_or(VcdiffError::SectionLengthMismatch)
        };
        let target_len = field()?;
        if target_len > MAX_TARGET_WINDOW as u64 {
            return Err(VcdiffError::WindowTooLarge(target_len));
        }
        let target_len = to_usize(target_len)?;

        let delta_indicator = *delta.get(c).ok_or(VcdiffError::SectionLengthMismatch)?;
        c += 1;
        if delta_indicator != 0 {
            return Err(VcdiffError::CompressedSections(delta_indicator));
        }

        let mut field = || -> Result<u64> {
            read_varint(delta, &mut c)?.ok_or(VcdiffError::SectionLengthMismatch)
        };
        let data_len = to_usize(field()?)?;
        let inst_len = to_usize(field()?)?;
        let addr_len = to_usize(field()?)?;
        let checksum = if indicator & VCD_ADLER32 != 0 {
            Some(field()? as u32)
        } else {
            None
        };

        let sections_len = data_len
            .checked_add(inst_len)
            .and_then(|n| n.checked_add(addr_len))
            .ok_or(VcdiffError::SectionLengthMismatch)?;
        if c.checked_add(sections_len) != Some(delta.len()) {
            return Err(VcdiffError::SectionLengthMismatch);
        }
        let data = &delta[c..c + data_len];
        let inst = &delta[c + data_len..c + data_len + inst_len];
        let addr = &delta[c + data_len + inst_len..];

        let interleaved = data_len == 0 && addr_len == 0;
        let mut sections = Sections {
            inst: Section::new("instructions", inst),
            data: (!interleaved).then(|| Section::new("data", data)),
            addr: (!interleaved).then(|| Section::new("addresses", addr)),
        };

        let window = run_instructions(source, target_len, &mut sections)?;

        for section in [&sections.data, &sections.addr].into_iter().flatten() {
            if !section.is_exhausted() {
                return Err(VcdiffError::TrailingSectionData(section.name));
            }
        }
        if window.len() != target_len {
            return Err(VcdiffError::SizeMismatch {
                expected: target_len,
                actual: window.len(),
            });
        }
        if let Some(expected) = checksum {
            let actual = adler32(&window);
            if actual != expected {
                return Err(VcdiffError::ChecksumMismatch { expected, actual });
            }
        }
        Ok(window)
    }
}

fn parse_header(header: &[u8]) -> Result<()> {
    if header[..3] != MAGIC {
        return Err(VcdiffError::BadMagic);
    }
    let version = header[3];
    if version != 0 && version != SDCH_VERSION {
        return Err(VcdiffError::UnsupportedVersion(version));
    }
    if header[4] != 0 {
        return Err(VcdiffError::UnsupportedHeader(header[4]));
    }
    Ok(())
}

fn run_instructions(
    source: &[u8],
    target_len: usize,
    sections: &mut Sections<'_>,
) -> Result<Vec<u8>> {
    let table = default_code_table();
    let mut cache = AddressCache::new();
    let mut window = Vec::with_capacity(target_len);

    while !sections.inst.is_exhausted() {
        let opcode = sections.inst.byte()?;
        for half in table[usize::from(opcode)] {
            if half.inst == Inst::Noop {
                continue;
            }
            let size = if half.size == 0 {
                to_usize(sections.inst.varint()?)?
            } else {
                usize::from(half.size)
            };
            if window.len().checked_add(size).is_none_or(|end| end > target_len) {
                return Err(VcdiffError::TargetOverflow);
            }
            match half.inst {
                Inst::Add => window.extend_from_slice(sections.data().take(size)?),
                Inst::Run => {
                    let b = sections.data().byte()?;
                    window.resize(window.len() + size, b);
                }
                Inst::Copy => {
                    let here = (source.len() + window.len()) as u64;
                    let addr = cache.decode(here, half.mode, sections.addr())? as usize;
                    // Byte at a time: the copy may overlap its own output
                    for i in 0..size {
                        let a = addr + i;
                        let b = if a < source.len() {
                            source[a]
                        } else {
                            window[a - source.len()]
                        };
                        window.push(b);
                    }
                }
                Inst::Noop => {}
            }
        }
    }
    Ok(window)
}
