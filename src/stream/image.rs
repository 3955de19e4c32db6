//! The Image driver — a byte sequence stored as fixed-size deflated chunks.
//!
//! Chunk `i` lives in the member `<stream>/<i:08>.dd`.  Every chunk holds
//! exactly `chunk_size` bytes except possibly the last; after close,
//! `count = ceil(size / chunk_size)`.  Writes buffer into a residual and
//! emit whole chunks as the boundary is crossed; reads inflate on demand
//! through the volume set's chunk cache.
//!
//! The same core carries the Encrypted driver: a cipher hook swaps deflate
//! for per-chunk encryption with `Stored` members, and a local plaintext
//! cache fronts decryption.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cache::ChunkCache;
use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::volume::VolumeSet;
use crate::zip::CompressionMethod;

use super::encrypted::CipherScheme;
use super::{register, StreamFlush, StreamType, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Read,
    Write,
}

pub(crate) struct ImageCore {
    set:         VolumeSet,
    name:        String,
    mode:        Mode,
    ty:          StreamType,
    properties:  Properties,
    chunk_size:  u64,
    size:        u64,
    readptr:     u64,
    /// Next chunk index to emit; equals the number of chunks written so far.
    chunk_id:    u64,
    residual:    Vec<u8>,
    cipher:      Option<Box<dyn CipherScheme>>,
    /// Decrypted-chunk cache, present exactly when `cipher` is.
    plain_cache: Option<ChunkCache>,
    closed:      bool,
}

impl ImageCore {
    pub(crate) fn new(
        set: &VolumeSet,
        name: &str,
        mode: Mode,
        ty: StreamType,
        properties: Properties,
        cipher: Option<Box<dyn CipherScheme>>,
    ) -> Result<Rc<RefCell<Self>>> {
        let chunk_size = match properties.get("chunk_size") {
            Some(v) => v
                .parse::<u64>()
                .ok()
                .filter(|&c| c > 0)
                .ok_or(Error::Parse { line: v.to_owned(), reason: "chunk_size" })?,
            None => DEFAULT_CHUNK_SIZE,
        };
        let size = match properties.get("size") {
            Some(v) => v.parse::<u64>().map_err(|_| Error::Parse {
                line: v.to_owned(),
                reason: "size",
            })?,
            None => 0,
        };
        let plain_cache = cipher.as_ref().map(|_| ChunkCache::default());

        let core = Rc::new(RefCell::new(Self {
            set: set.clone(),
            name: name.to_owned(),
            mode,
            ty,
            properties,
            chunk_size,
            size,
            readptr: 0,
            chunk_id: 0,
            residual: Vec::new(),
            cipher,
            plain_cache,
            closed: false,
        }));
        if mode == Mode::Write {
            register(set, name, &core);
        }
        Ok(core)
    }

    fn chunk_name(&self, chunk_id: u64) -> String {
        format!("{}/{:08}.dd", self.name, chunk_id)
    }

    // ── Write path ───────────────────────────────────────────────────────────

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::Unsupported("write on a stream opened for reading"));
        }
        self.readptr += data.len() as u64;
        self.size = self.size.max(self.readptr);
        self.residual.extend_from_slice(data);

        while self.residual.len() as u64 >= self.chunk_size {
            let rest = self.residual.split_off(self.chunk_size as usize);
            let chunk = std::mem::replace(&mut self.residual, rest);
            self.write_chunk(&chunk)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let name = self.chunk_name(self.chunk_id);
        match &self.cipher {
            Some(cipher) => {
                // Ciphertext is incompressible — store it raw.
                let sealed = cipher.encrypt_block(self.chunk_id, chunk)?;
                self.set.writestr(&name, &sealed, CompressionMethod::Stored)?;
            }
            None => self.set.writestr(&name, chunk, CompressionMethod::Deflate)?,
        }
        self.chunk_id += 1;
        Ok(())
    }

    // ── Read path ────────────────────────────────────────────────────────────

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.size.saturating_sub(self.readptr);
        let want = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0;
        while done < want {
            let chunk_id = self.readptr / self.chunk_size;
            let offset = (self.readptr % self.chunk_size) as usize;
            let chunk = self.read_chunk(chunk_id)?;
            if offset >= chunk.len() {
                break; // short chunk — nothing more to serve here
            }
            let n = (want - done).min(chunk.len() - offset);
            buf[done..done + n].copy_from_slice(&chunk[offset..offset + n]);
            done += n;
            self.readptr += n as u64;
        }
        Ok(done)
    }

    fn read_chunk(&mut self, chunk_id: u64) -> Result<Vec<u8>> {
        let name = self.chunk_name(chunk_id);
        match (&self.cipher, &mut self.plain_cache) {
            (Some(cipher), Some(cache)) => {
                if let Some(plain) = cache.get(&name) {
                    return Ok(plain.to_vec());
                }
                let sealed = self.set.read_member(&name)?;
                let plain = cipher.decrypt_block(chunk_id, &sealed)?;
                cache.put(&name, plain.clone());
                Ok(plain)
            }
            _ => self.set.read_member(&name),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Persist `<stream>/properties` reflecting the current state, so the
    /// containing volume is usable on its own.
    fn write_properties(&mut self, set: &VolumeSet) -> Result<()> {
        self.properties.set("type", self.ty.name());
        self.properties.set("name", self.name.clone());
        self.properties.set("size", self.size.to_string());
        self.properties.set("count", self.chunk_id.to_string());
        self.properties.set("chunk_size", self.chunk_size.to_string());
        set.writestr(
            &format!("{}/properties", self.name),
            self.properties.to_text().as_bytes(),
            CompressionMethod::Stored,
        )
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.mode == Mode::Write {
            if !self.residual.is_empty() {
                let last = std::mem::take(&mut self.residual);
                self.write_chunk(&last)?;
            }
            let set = self.set.clone();
            self.write_properties(&set)?;
            self.set.unregister_writer(&self.name);
        }
        Ok(())
    }

    pub(crate) fn seek_to(&mut self, pos: u64) -> Result<()> {
        if self.mode == Mode::Write {
            return Err(Error::Unsupported("seek on a stream opened for writing"));
        }
        self.readptr = pos;
        Ok(())
    }

    #[inline] pub(crate) fn name(&self) -> &str { &self.name }
    #[inline] pub(crate) fn size(&self) -> u64 { self.size }
    #[inline] pub(crate) fn tell(&self) -> u64 { self.readptr }
    #[inline] pub(crate) fn set_handle(&self) -> VolumeSet { self.set.clone() }

    /// Same as the registry hook, callable from the driver wrappers.
    pub(crate) fn flush_into_set(&mut self, set: &VolumeSet) -> Result<()> {
        self.flush_into(set)
    }
}

impl StreamFlush for ImageCore {
    fn flush_into(&mut self, set: &VolumeSet) -> Result<()> {
        if self.mode == Mode::Write && !self.closed {
            self.write_properties(set)?;
        }
        Ok(())
    }
}

impl Drop for ImageCore {
    fn drop(&mut self) {
        if self.mode == Mode::Write && !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!(stream = %self.name, error = %e, "best-effort stream close failed");
            }
        }
    }
}

// ── Public driver ────────────────────────────────────────────────────────────

/// A chunked image stream — see the module docs.
pub struct ImageStream {
    core: Rc<RefCell<ImageCore>>,
}

impl ImageStream {
    pub(crate) fn open(set: &VolumeSet, name: &str, props: Properties) -> Result<Self> {
        Ok(Self {
            core: ImageCore::new(set, name, Mode::Read, StreamType::Image, props, None)?,
        })
    }

    pub(crate) fn create(set: &VolumeSet, name: &str, props: Properties) -> Result<Self> {
        Ok(Self {
            core: ImageCore::new(set, name, Mode::Write, StreamType::Image, props, None)?,
        })
    }

    pub fn name(&self) -> String {
        self.core.borrow().name().to_owned()
    }

    pub fn size(&self) -> u64 {
        self.core.borrow().size()
    }

    pub fn tell(&self) -> u64 {
        self.core.borrow().tell()
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.core.borrow_mut().write(data)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.core.borrow_mut().read(buf)
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.core.borrow_mut().seek_to(pos)
    }

    /// Emit a self-sufficient `<stream>/properties` without finalizing.
    pub fn flush(&mut self) -> Result<()> {
        let set = self.core.borrow().set_handle();
        self.core.borrow_mut().flush_into_set(&set)
    }

    /// Emit the final (possibly short) chunk and the stream properties.
    pub fn close(&mut self) -> Result<()> {
        self.core.borrow_mut().close()
    }
}
