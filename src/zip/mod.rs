//! Minimal ZIP64 codec — exactly the subset the container format uses.
//!
//! # Scope
//!
//! Local File Headers, stored/deflate payloads, streaming members with
//! general-purpose bit 3 and a trailing data descriptor, and a Central
//! Directory rewritten at end-of-file on every volume close.  ZIP64 record
//! forms are always permitted; the writer switches to them automatically
//! when any field saturates its 16/32-bit slot.  Nothing else from the ZIP
//! family (spanning markers, encryption headers, other codecs) is read or
//! written.
//!
//! # Wire rules (frozen)
//!
//! - All numeric fields are little-endian.
//! - Streaming members set flag bit 3, zero the LFH CRC/size fields, and
//!   trail a 12-byte descriptor `<crc32:u32><compressed:u32><uncompressed:u32>`
//!   with no signature.
//! - Deflate is raw (no zlib wrapper).  Decompression feeds one trailing pad
//!   byte so a truncated tail still yields every recoverable byte.
//! - An entry whose compressed and uncompressed sizes are both zero is a
//!   tombstone: the name is logically deleted from the consolidated index.

pub mod reader;
pub mod writer;

use std::io::{Read, Write};

use chrono::{Datelike, Timelike, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

// ── Record signatures ────────────────────────────────────────────────────────

pub const LOCAL_FILE_HEADER_SIG:   u32 = 0x0403_4b50;
pub const CENTRAL_DIRECTORY_SIG:   u32 = 0x0201_4b50;
pub const END_OF_CENTRAL_DIR_SIG:  u32 = 0x0605_4b50;
pub const ZIP64_END_OF_CD_SIG:     u32 = 0x0606_4b50;
pub const ZIP64_EOCD_LOCATOR_SIG:  u32 = 0x0706_4b50;

/// Fixed portion of a Local File Header, before name and extra field.
pub const LOCAL_FILE_HEADER_LEN: usize = 30;

/// General-purpose flag bit 3: sizes and CRC trail the payload.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

// ── Compression method ───────────────────────────────────────────────────────

/// The two methods the format admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CompressionMethod {
    Stored  = 0,
    Deflate = 8,
}

impl CompressionMethod {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(CompressionMethod::Stored),
            8 => Some(CompressionMethod::Deflate),
            _ => None,
        }
    }
}

// ── Entry info ───────────────────────────────────────────────────────────────

/// One Central Directory row, as carried through the consolidated index.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub name:              String,
    pub method:            CompressionMethod,
    pub crc32:             u32,
    pub compressed_size:   u64,
    pub uncompressed_size: u64,
    /// Offset of this entry's Local File Header within its volume.
    pub header_offset:     u64,
    pub flags:             u16,
    /// MS-DOS date and time, as stored on the wire.
    pub dos_date:          u16,
    pub dos_time:          u16,
}

impl EntryInfo {
    /// Last-modified stamp in comparison order: later `(date, time)` wins.
    #[inline]
    pub fn date_time(&self) -> (u16, u16) {
        (self.dos_date, self.dos_time)
    }

    /// Both sizes zero — the entry marks a logical deletion.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.compressed_size == 0 && self.uncompressed_size == 0
    }
}

/// Current UTC time in MS-DOS `(date, time)` form (2-second resolution).
pub fn dos_datetime_now() -> (u16, u16) {
    let now = Utc::now();
    dos_datetime(
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
    )
}

/// Encode a calendar stamp into the MS-DOS on-disk form.  Years before 1980
/// clamp to the epoch.
pub fn dos_datetime(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> (u16, u16) {
    let y = (year.max(1980) - 1980) as u16;
    let date = (y << 9) | ((month as u16) << 5) | day as u16;
    let time = ((hour as u16) << 11) | ((min as u16) << 5) | (sec as u16 / 2);
    (date, time)
}

// ── Deflate helpers ──────────────────────────────────────────────────────────

/// Raw-deflate a whole buffer at the default level.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Inflate a raw deflate buffer.  One pad byte is chained behind the input so
/// a stream cut mid-block still flushes everything decodable; the decoder
/// stops at the final-block marker, so an intact stream never consumes it.
/// A tail truncated past the pad yields whatever was recoverable.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    const PAD: &[u8] = b"Z";
    let mut dec = DeflateDecoder::new(data.chain(PAD));
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut buf = [0u8; 8192];
    loop {
        match dec.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::integrity(format!("deflate stream: {e}"))),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_round_trip() {
        let data = b"Hello, World! Hello, World! Hello, World!";
        let packed = deflate(data).unwrap();
        assert_eq!(inflate(&packed).unwrap(), data);
    }

    #[test]
    fn dos_datetime_orders_chronologically() {
        let early = dos_datetime(2009, 3, 1, 12, 0, 0);
        let later = dos_datetime(2009, 3, 1, 12, 0, 2);
        let next_day = dos_datetime(2009, 3, 2, 0, 0, 0);
        assert!(early < later);
        assert!(later < next_day);
    }
}
