//! Record emission: Local File Headers, data descriptors, Central Directory.
//!
//! Every member is written through the streaming path — the LFH carries flag
//! bit 3 with zeroed CRC/sizes, the truth trails the payload as a 12-byte
//! descriptor, and the CD entry records the final values.  The CD (plus the
//! ZIP64 EOCD and locator when any field saturates) is emitted once per
//! volume close, at the current append position.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{
    CompressionMethod, EntryInfo, CENTRAL_DIRECTORY_SIG, END_OF_CENTRAL_DIR_SIG,
    FLAG_DATA_DESCRIPTOR, LOCAL_FILE_HEADER_SIG, ZIP64_END_OF_CD_SIG, ZIP64_EOCD_LOCATOR_SIG,
};
use crate::error::Result;

/// Emit a streaming Local File Header: bit 3 set, CRC and sizes zeroed.
/// Returns the header length, so the caller can compute the payload offset.
pub fn write_local_header<W: Write>(
    w: &mut W,
    name: &str,
    method: CompressionMethod,
    (dos_date, dos_time): (u16, u16),
) -> Result<u64> {
    w.write_u32::<LittleEndian>(LOCAL_FILE_HEADER_SIG)?;
    w.write_u16::<LittleEndian>(45)?; // version needed: ZIP64
    w.write_u16::<LittleEndian>(FLAG_DATA_DESCRIPTOR)?;
    w.write_u16::<LittleEndian>(method as u16)?;
    w.write_u16::<LittleEndian>(dos_time)?;
    w.write_u16::<LittleEndian>(dos_date)?;
    w.write_u32::<LittleEndian>(0)?; // crc32 — trails in the descriptor
    w.write_u32::<LittleEndian>(0)?; // compressed size
    w.write_u32::<LittleEndian>(0)?; // uncompressed size
    w.write_u16::<LittleEndian>(name.len() as u16)?;
    w.write_u16::<LittleEndian>(0)?; // extra length
    w.write_all(name.as_bytes())?;
    Ok(super::LOCAL_FILE_HEADER_LEN as u64 + name.len() as u64)
}

/// The 12-byte trailing descriptor: CRC-32, compressed size, uncompressed
/// size, little-endian, no signature.
pub fn write_data_descriptor<W: Write>(
    w: &mut W,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
) -> Result<()> {
    w.write_u32::<LittleEndian>(crc32)?;
    w.write_u32::<LittleEndian>(compressed_size as u32)?;
    w.write_u32::<LittleEndian>(uncompressed_size as u32)?;
    Ok(())
}

/// Emit the Central Directory for `entries`, then the ZIP64 records when
/// needed, then the classic EOCD.  `cd_offset` is the append position the
/// directory is being written at.
pub fn write_central_directory<W: Write>(
    w: &mut W,
    entries: &[EntryInfo],
    cd_offset: u64,
) -> Result<()> {
    let mut cd_size = 0u64;
    for entry in entries {
        cd_size += write_cd_entry(w, entry)?;
    }

    let need_zip64 = entries.len() > u16::MAX as usize
        || cd_size > u32::MAX as u64
        || cd_offset > u32::MAX as u64;

    if need_zip64 {
        let zip64_eocd_offset = cd_offset + cd_size;
        w.write_u32::<LittleEndian>(ZIP64_END_OF_CD_SIG)?;
        w.write_u64::<LittleEndian>(44)?; // size of the remaining fixed fields
        w.write_u16::<LittleEndian>(45)?;
        w.write_u16::<LittleEndian>(45)?;
        w.write_u32::<LittleEndian>(0)?; // this disk
        w.write_u32::<LittleEndian>(0)?; // CD disk
        w.write_u64::<LittleEndian>(entries.len() as u64)?;
        w.write_u64::<LittleEndian>(entries.len() as u64)?;
        w.write_u64::<LittleEndian>(cd_size)?;
        w.write_u64::<LittleEndian>(cd_offset)?;

        w.write_u32::<LittleEndian>(ZIP64_EOCD_LOCATOR_SIG)?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_u64::<LittleEndian>(zip64_eocd_offset)?;
        w.write_u32::<LittleEndian>(1)?; // total disks
    }

    w.write_u32::<LittleEndian>(END_OF_CENTRAL_DIR_SIG)?;
    w.write_u16::<LittleEndian>(0)?; // this disk
    w.write_u16::<LittleEndian>(0)?; // CD disk
    let count_16 = if entries.len() > u16::MAX as usize { 0xFFFF } else { entries.len() as u16 };
    w.write_u16::<LittleEndian>(count_16)?;
    w.write_u16::<LittleEndian>(count_16)?;
    w.write_u32::<LittleEndian>(saturate_32(cd_size))?;
    w.write_u32::<LittleEndian>(saturate_32(cd_offset))?;
    w.write_u16::<LittleEndian>(0)?; // comment length
    Ok(())
}

/// One CD record with its ZIP64 extra field when any value saturates.
/// Returns the record's byte length.
fn write_cd_entry<W: Write>(w: &mut W, entry: &EntryInfo) -> Result<u64> {
    let mut extra_body = Vec::new();
    if entry.uncompressed_size > u32::MAX as u64 {
        extra_body.write_u64::<LittleEndian>(entry.uncompressed_size)?;
    }
    if entry.compressed_size > u32::MAX as u64 {
        extra_body.write_u64::<LittleEndian>(entry.compressed_size)?;
    }
    if entry.header_offset > u32::MAX as u64 {
        extra_body.write_u64::<LittleEndian>(entry.header_offset)?;
    }
    let mut extra = Vec::new();
    if !extra_body.is_empty() {
        extra.write_u16::<LittleEndian>(0x0001)?;
        extra.write_u16::<LittleEndian>(extra_body.len() as u16)?;
        extra.extend_from_slice(&extra_body);
    }

    w.write_u32::<LittleEndian>(CENTRAL_DIRECTORY_SIG)?;
    w.write_u16::<LittleEndian>(45)?; // version made by
    w.write_u16::<LittleEndian>(45)?; // version needed
    w.write_u16::<LittleEndian>(entry.flags)?;
    w.write_u16::<LittleEndian>(entry.method as u16)?;
    w.write_u16::<LittleEndian>(entry.dos_time)?;
    w.write_u16::<LittleEndian>(entry.dos_date)?;
    w.write_u32::<LittleEndian>(entry.crc32)?;
    w.write_u32::<LittleEndian>(saturate_32(entry.compressed_size))?;
    w.write_u32::<LittleEndian>(saturate_32(entry.uncompressed_size))?;
    w.write_u16::<LittleEndian>(entry.name.len() as u16)?;
    w.write_u16::<LittleEndian>(extra.len() as u16)?;
    w.write_u16::<LittleEndian>(0)?; // comment length
    w.write_u16::<LittleEndian>(0)?; // disk number start
    w.write_u16::<LittleEndian>(0)?; // internal attributes
    w.write_u32::<LittleEndian>(0)?; // external attributes
    w.write_u32::<LittleEndian>(saturate_32(entry.header_offset))?;
    w.write_all(entry.name.as_bytes())?;
    w.write_all(&extra)?;

    Ok(46 + entry.name.len() as u64 + extra.len() as u64)
}

#[inline]
fn saturate_32(v: u64) -> u32 {
    if v > u32::MAX as u64 { 0xFFFF_FFFF } else { v as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::reader::{read_central_directory, resolve_data_offset};
    use crate::zip::dos_datetime;
    use std::io::Cursor;

    /// Hand-build a one-member volume and read it back through the CD path.
    #[test]
    fn written_directory_parses_back() {
        let mut buf = Cursor::new(Vec::new());
        let dos = dos_datetime(2009, 6, 1, 10, 30, 0);
        let header_len =
            write_local_header(&mut buf, "probe", CompressionMethod::Stored, dos).unwrap();
        buf.write_all(b"payload").unwrap();
        let mut crc = crc32fast::Hasher::new();
        crc.update(b"payload");
        let crc = crc.finalize();
        write_data_descriptor(&mut buf, crc, 7, 7).unwrap();

        let entry = EntryInfo {
            name:              "probe".into(),
            method:            CompressionMethod::Stored,
            crc32:             crc,
            compressed_size:   7,
            uncompressed_size: 7,
            header_offset:     0,
            flags:             FLAG_DATA_DESCRIPTOR,
            dos_date:          dos.0,
            dos_time:          dos.1,
        };
        let cd_offset = header_len + 7 + 12;
        write_central_directory(&mut buf, &[entry], cd_offset).unwrap();

        let cd = read_central_directory(&mut buf).unwrap();
        assert_eq!(cd.cd_offset, cd_offset);
        assert_eq!(cd.entries.len(), 1);
        let e = &cd.entries[0];
        assert_eq!(e.name, "probe");
        assert_eq!(e.crc32, crc);
        assert_eq!((e.compressed_size, e.uncompressed_size), (7, 7));

        let data_offset = resolve_data_offset(&mut buf, e.header_offset).unwrap();
        assert_eq!(data_offset, header_len);
    }
}
