//! Central Directory parsing: EOCD discovery, ZIP64 promotion, CD walk.
//!
//! The reader trusts the CD and nothing else — streamed members keep zeroed
//! sizes in their Local File Headers, so only the rewritten-on-close CD
//! carries the truth.  Local headers are parsed lazily, at member-access
//! time, to learn the writer's actual name/extra lengths (a foreign writer
//! may pad the LFH extra field differently from the CD copy).

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use super::{
    CompressionMethod, EntryInfo, CENTRAL_DIRECTORY_SIG, END_OF_CENTRAL_DIR_SIG,
    LOCAL_FILE_HEADER_SIG, ZIP64_END_OF_CD_SIG, ZIP64_EOCD_LOCATOR_SIG,
};
use crate::error::{Error, Result};

/// How far back from end-of-file the EOCD scan reaches: maximum comment
/// length plus the fixed record.
const EOCD_SEARCH_SPAN: u64 = 65_535 + 22;

/// Parsed directory of one volume.
#[derive(Debug)]
pub struct CentralDirectory {
    pub entries:   Vec<EntryInfo>,
    /// Byte offset where the CD begins — the append position for reopening
    /// a volume (the old CD is overwritten and re-emitted on close).
    pub cd_offset: u64,
}

/// Read and validate the complete Central Directory of `file`.
pub fn read_central_directory<R: Read + Seek>(file: &mut R) -> Result<CentralDirectory> {
    let (eocd_offset, file_len) = find_eocd(file)?;

    file.seek(SeekFrom::Start(eocd_offset + 4))?;
    let _disk_number = file.read_u16::<LittleEndian>()?;
    let _cd_disk = file.read_u16::<LittleEndian>()?;
    let _entries_on_disk = file.read_u16::<LittleEndian>()?;
    let total_entries_16 = file.read_u16::<LittleEndian>()?;
    let cd_size_32 = file.read_u32::<LittleEndian>()?;
    let cd_offset_32 = file.read_u32::<LittleEndian>()?;

    let mut total_entries = total_entries_16 as u64;
    let mut cd_offset = cd_offset_32 as u64;

    if total_entries_16 == 0xFFFF || cd_size_32 == 0xFFFF_FFFF || cd_offset_32 == 0xFFFF_FFFF {
        let (z_entries, z_offset) = read_zip64_eocd(file, eocd_offset)?;
        total_entries = z_entries;
        cd_offset = z_offset;
    }

    if cd_offset > file_len {
        return Err(Error::integrity(format!(
            "central directory offset {cd_offset} beyond end of file {file_len}"
        )));
    }

    file.seek(SeekFrom::Start(cd_offset))?;
    let mut entries = Vec::with_capacity(total_entries as usize);
    for _ in 0..total_entries {
        entries.push(read_cd_entry(file)?);
    }

    Ok(CentralDirectory { entries, cd_offset })
}

/// Locate the End Of Central Directory record by scanning backward through
/// the file tail.  Returns `(eocd_offset, file_len)`.
fn find_eocd<R: Read + Seek>(file: &mut R) -> Result<(u64, u64)> {
    let file_len = file.seek(SeekFrom::End(0))?;
    if file_len < 22 {
        return Err(Error::integrity("file too short to hold a central directory"));
    }

    let span = EOCD_SEARCH_SPAN.min(file_len);
    let start = file_len - span;
    file.seek(SeekFrom::Start(start))?;
    let mut tail = vec![0u8; span as usize];
    file.read_exact(&mut tail)?;

    let sig = END_OF_CENTRAL_DIR_SIG.to_le_bytes();
    for i in (0..=tail.len() - 22).rev() {
        if tail[i..i + 4] == sig {
            return Ok((start + i as u64, file_len));
        }
    }
    Err(Error::integrity("end of central directory record not found"))
}

/// Follow the ZIP64 EOCD locator (directly preceding the classic EOCD) and
/// read the ZIP64 EOCD record.  Returns `(total_entries, cd_offset)`.
fn read_zip64_eocd<R: Read + Seek>(file: &mut R, eocd_offset: u64) -> Result<(u64, u64)> {
    if eocd_offset < 20 {
        return Err(Error::integrity("ZIP64 marker set but no room for a locator"));
    }
    file.seek(SeekFrom::Start(eocd_offset - 20))?;
    if file.read_u32::<LittleEndian>()? != ZIP64_EOCD_LOCATOR_SIG {
        return Err(Error::integrity("ZIP64 EOCD locator signature missing"));
    }
    let _locator_disk = file.read_u32::<LittleEndian>()?;
    let zip64_eocd_offset = file.read_u64::<LittleEndian>()?;

    file.seek(SeekFrom::Start(zip64_eocd_offset))?;
    if file.read_u32::<LittleEndian>()? != ZIP64_END_OF_CD_SIG {
        return Err(Error::integrity("ZIP64 EOCD signature missing"));
    }
    let _record_size = file.read_u64::<LittleEndian>()?;
    let _version_made = file.read_u16::<LittleEndian>()?;
    let _version_needed = file.read_u16::<LittleEndian>()?;
    let _disk = file.read_u32::<LittleEndian>()?;
    let _cd_disk = file.read_u32::<LittleEndian>()?;
    let _entries_on_disk = file.read_u64::<LittleEndian>()?;
    let total_entries = file.read_u64::<LittleEndian>()?;
    let _cd_size = file.read_u64::<LittleEndian>()?;
    let cd_offset = file.read_u64::<LittleEndian>()?;

    Ok((total_entries, cd_offset))
}

/// Parse one Central Directory entry at the current position, including the
/// 0x0001 ZIP64 extra field when any 32-bit size slot is saturated.
fn read_cd_entry<R: Read + Seek>(file: &mut R) -> Result<EntryInfo> {
    if file.read_u32::<LittleEndian>()? != CENTRAL_DIRECTORY_SIG {
        return Err(Error::integrity("central directory entry signature mismatch"));
    }
    let _version_made = file.read_u16::<LittleEndian>()?;
    let _version_needed = file.read_u16::<LittleEndian>()?;
    let flags = file.read_u16::<LittleEndian>()?;
    let method_raw = file.read_u16::<LittleEndian>()?;
    let dos_time = file.read_u16::<LittleEndian>()?;
    let dos_date = file.read_u16::<LittleEndian>()?;
    let crc32 = file.read_u32::<LittleEndian>()?;
    let compressed_32 = file.read_u32::<LittleEndian>()?;
    let uncompressed_32 = file.read_u32::<LittleEndian>()?;
    let name_len = file.read_u16::<LittleEndian>()? as usize;
    let extra_len = file.read_u16::<LittleEndian>()? as usize;
    let comment_len = file.read_u16::<LittleEndian>()? as usize;
    let _disk_start = file.read_u16::<LittleEndian>()?;
    let _internal_attrs = file.read_u16::<LittleEndian>()?;
    let _external_attrs = file.read_u32::<LittleEndian>()?;
    let header_offset_32 = file.read_u32::<LittleEndian>()?;

    let mut name_bytes = vec![0u8; name_len];
    file.read_exact(&mut name_bytes)?;
    let name = String::from_utf8(name_bytes)
        .map_err(|_| Error::integrity("member name is not valid UTF-8"))?;

    let mut extra = vec![0u8; extra_len];
    file.read_exact(&mut extra)?;
    file.seek(SeekFrom::Current(comment_len as i64))?;

    let method = CompressionMethod::from_u16(method_raw)
        .ok_or_else(|| Error::integrity(format!("unsupported compression method {method_raw}")))?;

    let mut uncompressed_size = uncompressed_32 as u64;
    let mut compressed_size = compressed_32 as u64;
    let mut header_offset = header_offset_32 as u64;

    // ZIP64 extra: u64 replacements appear in a fixed order, each present
    // only when its 32-bit slot is saturated.
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let len = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let body = extra
            .get(pos + 4..pos + 4 + len)
            .ok_or_else(|| Error::integrity("extra field overruns CD entry"))?;
        if id == 0x0001 {
            let mut at = 0;
            let mut take = |wanted: bool| -> Result<Option<u64>> {
                if !wanted {
                    return Ok(None);
                }
                let b = body
                    .get(at..at + 8)
                    .ok_or_else(|| Error::integrity("short ZIP64 extra field"))?;
                at += 8;
                Ok(Some(u64::from_le_bytes(b.try_into().unwrap())))
            };
            if let Some(v) = take(uncompressed_32 == 0xFFFF_FFFF)? {
                uncompressed_size = v;
            }
            if let Some(v) = take(compressed_32 == 0xFFFF_FFFF)? {
                compressed_size = v;
            }
            if let Some(v) = take(header_offset_32 == 0xFFFF_FFFF)? {
                header_offset = v;
            }
        }
        pos += 4 + len;
    }

    Ok(EntryInfo {
        name,
        method,
        crc32,
        compressed_size,
        uncompressed_size,
        header_offset,
        flags,
        dos_date,
        dos_time,
    })
}

/// Parse the Local File Header at `header_offset` and return the offset of
/// the first payload byte.  This honors the LFH's own name/extra lengths
/// rather than reconstructing them from the CD copy.
pub fn resolve_data_offset<R: Read + Seek>(file: &mut R, header_offset: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(header_offset))?;
    if file.read_u32::<LittleEndian>()? != LOCAL_FILE_HEADER_SIG {
        return Err(Error::integrity("local file header signature mismatch"));
    }
    file.seek(SeekFrom::Current(22))?; // version..uncompressed_size
    let name_len = file.read_u16::<LittleEndian>()? as u64;
    let extra_len = file.read_u16::<LittleEndian>()? as u64;
    Ok(header_offset + super::LOCAL_FILE_HEADER_LEN as u64 + name_len + extra_len)
}
