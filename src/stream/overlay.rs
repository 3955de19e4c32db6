//! The Overlay driver — chunk geometry over bytes that live in external
//! files, so an archive can piggy-back on evidence containers it does not
//! copy.
//!
//! Each chunk is one row `chunk_id,offset,size,compression,filename_id` in a
//! deflated `<stream>/overlay.NN` member; `NN` increments per close so an
//! appended volume never clobbers an earlier table.  The `target` property
//! array maps `filename_id` to a `file://` URL.  A row with nonzero
//! `compression` holds a zlib-wrapped deflate payload at the external
//! offset; otherwise the bytes are verbatim.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Read as _;
use std::rc::Rc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::volume::VolumeSet;
use crate::zip::CompressionMethod;

use super::{register, StreamFlush, StreamType, Target, DEFAULT_CHUNK_SIZE};

/// One chunk row: where the bytes live and how they are packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayChunk {
    pub offset:      u64,
    pub size:        u64,
    pub compression: u32,
    pub filename_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

struct OverlayCore {
    set:         VolumeSet,
    name:        String,
    mode:        Mode,
    properties:  Properties,
    chunks:      BTreeMap<u64, OverlayChunk>,
    /// Interned external paths; a chunk's `filename_id` indexes this.
    filenames:   Vec<String>,
    targets:     Vec<Target>, // resolved in read mode only
    chunk_size:  u64,
    size:        u64,
    readptr:     u64,
    /// Sequence number for the next `overlay.NN` member.
    overlay_seq: u32,
    closed:      bool,
}

impl OverlayCore {
    fn new(set: &VolumeSet, name: &str, mode: Mode, properties: Properties) -> Result<Self> {
        let chunk_size = match properties.get("chunk_size") {
            Some(v) => v
                .parse::<u64>()
                .ok()
                .filter(|&c| c > 0)
                .ok_or(Error::Parse { line: v.to_owned(), reason: "chunk_size" })?,
            None => DEFAULT_CHUNK_SIZE,
        };
        let size = match properties.get("size") {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Parse { line: v.to_owned(), reason: "size" })?,
            None => 0,
        };
        let overlay_seq = properties.get_array("overlay").len() as u32;

        let targets = match mode {
            Mode::Read => properties
                .get_array("target")
                .iter()
                .map(|u| Target::resolve(set, u))
                .collect::<Result<Vec<_>>>()?,
            Mode::Write => Vec::new(),
        };

        let mut core = Self {
            set: set.clone(),
            name: name.to_owned(),
            mode,
            properties,
            chunks: BTreeMap::new(),
            filenames: Vec::new(),
            targets,
            chunk_size,
            size,
            readptr: 0,
            overlay_seq,
            closed: false,
        };
        if mode == Mode::Read {
            core.load_tables()?;
        }
        Ok(core)
    }

    /// Parse every `overlay.NN` segment named by the `overlay` property.
    fn load_tables(&mut self) -> Result<()> {
        let segments: Vec<String> = self.properties.get_array("overlay").to_vec();
        for segment in segments {
            let raw = self.set.read_member(&format!("{}/{segment}", self.name))?;
            let text = String::from_utf8_lossy(&raw);
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let mut fields = line.split(',');
                let parsed = (|| {
                    let id: u64 = fields.next()?.trim().parse().ok()?;
                    let offset = fields.next()?.trim().parse().ok()?;
                    let size = fields.next()?.trim().parse().ok()?;
                    let compression = fields.next()?.trim().parse().ok()?;
                    let filename_id = fields.next()?.trim().parse().ok()?;
                    Some((id, OverlayChunk { offset, size, compression, filename_id }))
                })();
                match parsed {
                    Some((id, chunk)) => {
                        self.chunks.insert(id, chunk);
                    }
                    None => warn!(stream = %self.name, line, "skipping malformed overlay row"),
                }
            }
        }
        Ok(())
    }

    // ── Write path ───────────────────────────────────────────────────────────

    /// Describe chunk `chunk_id` as `size` bytes at `offset` inside
    /// `filename` (interned into the target table on first use).
    fn set_chunk(
        &mut self,
        chunk_id: u64,
        offset: u64,
        size: u64,
        compression: u32,
        filename: &str,
    ) {
        let filename_id = match self.filenames.iter().position(|f| f == filename) {
            Some(i) => i,
            None => {
                self.filenames.push(filename.to_owned());
                self.filenames.len() - 1
            }
        };
        self.chunks.insert(chunk_id, OverlayChunk { offset, size, compression, filename_id });
    }

    fn write_table(&mut self) -> Result<()> {
        for filename in &self.filenames {
            let url = if filename.starts_with("file://") {
                filename.clone()
            } else {
                format!("file://{filename}")
            };
            self.properties.append("target", url);
        }

        let segment = format!("overlay.{:02}", self.overlay_seq);
        self.overlay_seq += 1;
        let mut table = String::new();
        for (id, c) in &self.chunks {
            table.push_str(&format!(
                "{id},{},{},{},{}\n",
                c.offset, c.size, c.compression, c.filename_id
            ));
        }
        self.set.writestr(
            &format!("{}/{segment}", self.name),
            table.as_bytes(),
            CompressionMethod::Deflate,
        )?;
        self.properties.append("overlay", segment);
        Ok(())
    }

    // ── Read path ────────────────────────────────────────────────────────────

    fn read_chunk(&mut self, chunk_id: u64) -> Result<Vec<u8>> {
        let chunk = *self
            .chunks
            .get(&chunk_id)
            .ok_or_else(|| Error::NotFound(format!("{}/{chunk_id:08}.dd", self.name)))?;
        let target = self.targets.get_mut(chunk.filename_id).ok_or_else(|| {
            Error::integrity(format!(
                "overlay chunk {chunk_id} references missing target {}",
                chunk.filename_id
            ))
        })?;

        let mut raw = vec![0u8; chunk.size as usize];
        let n = target.read_at(chunk.offset, &mut raw)?;
        raw.truncate(n);

        if chunk.compression != 0 {
            let mut plain = Vec::with_capacity(self.chunk_size as usize);
            flate2::read::ZlibDecoder::new(&raw[..])
                .read_to_end(&mut plain)
                .map_err(|e| Error::integrity(format!("overlay chunk {chunk_id}: {e}")))?;
            Ok(plain)
        } else {
            Ok(raw)
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode == Mode::Write {
            return Err(Error::Unsupported("read on an overlay stream opened for writing"));
        }
        let remaining = self.size.saturating_sub(self.readptr);
        let want = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0;
        while done < want {
            let chunk_id = self.readptr / self.chunk_size;
            let offset = (self.readptr % self.chunk_size) as usize;
            let chunk = self.read_chunk(chunk_id)?;
            if offset >= chunk.len() {
                break;
            }
            let n = (want - done).min(chunk.len() - offset);
            buf[done..done + n].copy_from_slice(&chunk[offset..offset + n]);
            done += n;
            self.readptr += n as u64;
        }
        Ok(done)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn write_properties(&mut self, set: &VolumeSet) -> Result<()> {
        self.properties.set("type", StreamType::Overlay.name());
        self.properties.set("name", self.name.clone());
        self.properties.set("size", self.size.to_string());
        self.properties.set("count", self.chunks.len().to_string());
        self.properties.set("chunk_size", self.chunk_size.to_string());
        set.writestr(
            &format!("{}/properties", self.name),
            self.properties.to_text().as_bytes(),
            CompressionMethod::Stored,
        )
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.mode == Mode::Write {
            self.write_table()?;
            let set = self.set.clone();
            self.write_properties(&set)?;
            self.set.unregister_writer(&self.name);
        }
        Ok(())
    }
}

impl StreamFlush for OverlayCore {
    fn flush_into(&mut self, set: &VolumeSet) -> Result<()> {
        if self.mode == Mode::Write && !self.closed {
            self.write_properties(set)?;
        }
        Ok(())
    }
}

impl Drop for OverlayCore {
    fn drop(&mut self) {
        if self.mode == Mode::Write && !self.closed {
            if let Err(e) = self.close() {
                warn!(stream = %self.name, error = %e, "best-effort overlay close failed");
            }
        }
    }
}

// ── Public driver ────────────────────────────────────────────────────────────

/// An overlay stream — see the module docs.
pub struct OverlayStream {
    core: Rc<RefCell<OverlayCore>>,
}

impl OverlayStream {
    pub(crate) fn open(set: &VolumeSet, name: &str, props: Properties) -> Result<Self> {
        Ok(Self { core: Rc::new(RefCell::new(OverlayCore::new(set, name, Mode::Read, props)?)) })
    }

    pub(crate) fn create(set: &VolumeSet, name: &str, props: Properties) -> Result<Self> {
        let core = Rc::new(RefCell::new(OverlayCore::new(set, name, Mode::Write, props)?));
        register(set, name, &core);
        Ok(Self { core })
    }

    pub fn name(&self) -> String {
        self.core.borrow().name.clone()
    }

    pub fn size(&self) -> u64 {
        self.core.borrow().size
    }

    pub fn tell(&self) -> u64 {
        self.core.borrow().readptr
    }

    /// Set the logical stream length (reads clamp to it).
    pub fn set_size(&mut self, size: u64) {
        self.core.borrow_mut().size = size;
    }

    /// Describe one chunk's location in an external file.
    pub fn set_chunk(
        &mut self,
        chunk_id: u64,
        offset: u64,
        size: u64,
        compression: u32,
        filename: &str,
    ) {
        self.core.borrow_mut().set_chunk(chunk_id, offset, size, compression, filename);
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.core.borrow_mut().read(buf)
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.core.borrow_mut().readptr = pos;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let set = self.core.borrow().set.clone();
        self.core.borrow_mut().flush_into(&set)
    }

    pub fn close(&mut self) -> Result<()> {
        self.core.borrow_mut().close()
    }
}
