//! Random-access handle over a single archive member.
//!
//! Read mode is a seekable window over the stored byte range inside one
//! backing volume.  Write mode streams into the active volume's append
//! position: CRC-32 accumulates over the uncompressed bytes, an optional raw
//! deflate encoder sits between the caller and the volume, and `close` emits
//! the 12-byte data descriptor, registers the Central Directory entry, and
//! releases the volume write lock.  Deflate members cannot seek in either
//! direction — a compressed byte range has no addressable interior.

use std::io::{self, SeekFrom, Write};

use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::volume::VolumeSet;
use crate::zip::{writer, CompressionMethod, EntryInfo, FLAG_DATA_DESCRIPTOR};

pub struct MemberStream {
    inner: Inner,
}

enum Inner {
    Read(ReadState),
    Write(Box<WriteState>),
}

struct ReadState {
    set:         VolumeSet,
    volume:      usize,
    data_offset: u64,
    size:        u64,
    pos:         u64,
}

struct WriteState {
    set:               VolumeSet,
    name:              String,
    method:            CompressionMethod,
    header_offset:     u64,
    dos:               (u16, u16),
    crc:               crc32fast::Hasher,
    uncompressed_size: u64,
    stored_size:       u64,
    encoder:           Option<DeflateEncoder<VolumeAppender>>,
    closed:            bool,
}

/// `io::Write` adapter that appends to the active volume and counts bytes —
/// this is what the deflate encoder drains into.
struct VolumeAppender {
    set:     VolumeSet,
    written: u64,
}

impl Write for VolumeAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.set
            .raw_append(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemberStream {
    pub(crate) fn new_read(set: VolumeSet, volume: usize, data_offset: u64, size: u64) -> Self {
        Self {
            inner: Inner::Read(ReadState { set, volume, data_offset, size, pos: 0 }),
        }
    }

    pub(crate) fn new_write(
        set: VolumeSet,
        name: String,
        method: CompressionMethod,
        header_offset: u64,
        dos: (u16, u16),
    ) -> Self {
        let encoder = match method {
            CompressionMethod::Deflate => Some(DeflateEncoder::new(
                VolumeAppender { set: set.clone(), written: 0 },
                Compression::default(),
            )),
            CompressionMethod::Stored => None,
        };
        Self {
            inner: Inner::Write(Box::new(WriteState {
                set,
                name,
                method,
                header_offset,
                dos,
                crc: crc32fast::Hasher::new(),
                uncompressed_size: 0,
                stored_size: 0,
                encoder,
                closed: false,
            })),
        }
    }

    /// Bytes remaining below the member size are read from the backing
    /// volume; reads past the end return short.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.inner {
            Inner::Write(_) => Err(Error::Unsupported("read on a member opened for writing")),
            Inner::Read(r) => {
                let want = (buf.len() as u64).min(r.size.saturating_sub(r.pos)) as usize;
                if want == 0 {
                    return Ok(0);
                }
                let n = r
                    .set
                    .read_at_volume(r.volume, r.data_offset + r.pos, &mut buf[..want])?;
                r.pos += n as u64;
                Ok(n)
            }
        }
    }

    /// Append to the volume.  The CRC covers the bytes as given; a deflate
    /// member compresses them on the way through.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.inner {
            Inner::Read(_) => Err(Error::Unsupported("write on a member opened for reading")),
            Inner::Write(w) => {
                w.crc.update(data);
                w.uncompressed_size += data.len() as u64;
                match &mut w.encoder {
                    Some(enc) => enc.write_all(data)?,
                    None => {
                        w.set.raw_append(data)?;
                        w.stored_size += data.len() as u64;
                    }
                }
                Ok(())
            }
        }
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match &mut self.inner {
            Inner::Write(_) => Err(Error::Unsupported("seek on a member opened for writing")),
            Inner::Read(r) => {
                let target = match pos {
                    SeekFrom::Start(p) => p as i64,
                    SeekFrom::Current(d) => r.pos as i64 + d,
                    SeekFrom::End(d) => r.size as i64 + d,
                };
                if target < 0 {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek before start of member",
                    )));
                }
                r.pos = target as u64;
                Ok(r.pos)
            }
        }
    }

    pub fn tell(&self) -> u64 {
        match &self.inner {
            Inner::Read(r) => r.pos,
            Inner::Write(w) => w.uncompressed_size,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.inner {
            Inner::Read(r) => r.size,
            Inner::Write(w) => w.uncompressed_size,
        }
    }

    /// Finalize a written member: flush the deflate trailer, emit the data
    /// descriptor, register the CD entry, and release the write lock.
    /// Idempotent; a no-op for read handles.
    pub fn close(&mut self) -> Result<()> {
        let Inner::Write(w) = &mut self.inner else { return Ok(()) };
        if w.closed {
            return Ok(());
        }
        w.closed = true;

        let compressed_size = match w.encoder.take() {
            Some(enc) => enc.finish()?.written,
            None => w.stored_size,
        };
        let crc32 = std::mem::take(&mut w.crc).finalize();

        let mut descriptor = Vec::with_capacity(12);
        writer::write_data_descriptor(&mut descriptor, crc32, compressed_size, w.uncompressed_size)?;
        w.set.raw_append(&descriptor)?;

        let entry = EntryInfo {
            name:              w.name.clone(),
            method:            w.method,
            crc32,
            compressed_size,
            uncompressed_size: w.uncompressed_size,
            header_offset:     w.header_offset,
            flags:             FLAG_DATA_DESCRIPTOR,
            dos_date:          w.dos.0,
            dos_time:          w.dos.1,
        };
        w.set.finish_member(entry)
    }
}

impl Drop for MemberStream {
    fn drop(&mut self) {
        // Unclosed writer going out of scope: finalize so the lock is
        // released and the volume stays recoverable.
        let unclosed = matches!(&self.inner, Inner::Write(w) if !w.closed);
        if unclosed {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "best-effort member close failed");
            }
        }
    }
}
