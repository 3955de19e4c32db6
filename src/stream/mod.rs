//! Stream drivers — the logical byte sequences layered over the archive.
//!
//! A stream is a group of members under a common name prefix, with a driver
//! selected by the `type` property in `<stream>/properties`:
//!
//! | `type`      | driver                                            |
//! |-------------|---------------------------------------------------|
//! | `Image`     | fixed-size deflated chunks `<stream>/<08d>.dd`     |
//! | `Map`       | periodic piecewise-linear mapping onto targets     |
//! | `Overlay`   | chunk table referencing external files             |
//! | `Encrypted` | Image with per-chunk block encryption, stored raw  |
//!
//! Drivers hold the volume set by cheap-clone handle and identify themselves
//! by stream name; all cross-references go through the consolidated index.
//! The registry of driver types is the [`StreamType`] variant set — small on
//! purpose, extended by adding a variant and an arm here.

pub mod encrypted;
pub mod image;
pub mod map;
pub mod overlay;

use std::fs::File;
use std::io::{self, Read as _, Seek as _, SeekFrom};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::volume::VolumeSet;

pub use encrypted::{EncryptedStream, EnvKeyProvider, KeyProvider, StaticKeyProvider};
pub use image::ImageStream;
pub use map::MapStream;
pub use overlay::OverlayStream;

/// Default chunk size for Image and Encrypted streams: 32 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024;

// ── Writer registry hook ─────────────────────────────────────────────────────

/// Implemented by every driver core.  Called by the volume set when it is
/// about to switch volumes or close: the writer must leave a self-sufficient
/// copy of its `<stream>/properties` in the current volume, without
/// finalizing the stream.
pub(crate) trait StreamFlush {
    fn flush_into(&mut self, set: &VolumeSet) -> Result<()>;
}

// ── Stream type registry ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Image,
    Map,
    Overlay,
    Encrypted,
}

impl StreamType {
    pub fn name(self) -> &'static str {
        match self {
            StreamType::Image => "Image",
            StreamType::Map => "Map",
            StreamType::Overlay => "Overlay",
            StreamType::Encrypted => "Encrypted",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "Image" => Some(StreamType::Image),
            "Map" => Some(StreamType::Map),
            "Overlay" => Some(StreamType::Overlay),
            "Encrypted" => Some(StreamType::Encrypted),
            _ => None,
        }
    }
}

// ── Tagged stream variant ────────────────────────────────────────────────────

/// One open stream, whatever its driver.
pub enum Stream {
    Image(ImageStream),
    Map(MapStream),
    Overlay(OverlayStream),
    Encrypted(EncryptedStream),
}

impl Stream {
    pub fn stream_type(&self) -> StreamType {
        match self {
            Stream::Image(_) => StreamType::Image,
            Stream::Map(_) => StreamType::Map,
            Stream::Overlay(_) => StreamType::Overlay,
            Stream::Encrypted(_) => StreamType::Encrypted,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Stream::Image(s) => s.name(),
            Stream::Map(s) => s.name(),
            Stream::Overlay(s) => s.name(),
            Stream::Encrypted(s) => s.name(),
        }
    }

    /// Logical length in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Stream::Image(s) => s.size(),
            Stream::Map(s) => s.size(),
            Stream::Overlay(s) => s.size(),
            Stream::Encrypted(s) => s.size(),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Stream::Image(s) => s.read(buf),
            Stream::Map(s) => s.read(buf),
            Stream::Overlay(s) => s.read(buf),
            Stream::Encrypted(s) => s.read(buf),
        }
    }

    /// Read up to `len` bytes from the current position.
    pub fn read_to_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Byte writes land on Image and Encrypted streams; Map and Overlay
    /// streams are described through their driver-specific APIs instead.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Stream::Image(s) => s.write(data),
            Stream::Encrypted(s) => s.write(data),
            Stream::Map(_) => Err(Error::Unsupported("byte writes on a Map stream")),
            Stream::Overlay(_) => Err(Error::Unsupported("byte writes on an Overlay stream")),
        }
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        match self {
            Stream::Image(s) => s.seek_to(pos),
            Stream::Map(s) => s.seek_to(pos),
            Stream::Overlay(s) => s.seek_to(pos),
            Stream::Encrypted(s) => s.seek_to(pos),
        }
    }

    pub fn tell(&self) -> u64 {
        match self {
            Stream::Image(s) => s.tell(),
            Stream::Map(s) => s.tell(),
            Stream::Overlay(s) => s.tell(),
            Stream::Encrypted(s) => s.tell(),
        }
    }

    /// Emit a self-sufficient `<stream>/properties` without finalizing.
    pub fn flush(&mut self) -> Result<()> {
        match self {
            Stream::Image(s) => s.flush(),
            Stream::Map(s) => s.flush(),
            Stream::Overlay(s) => s.flush(),
            Stream::Encrypted(s) => s.flush(),
        }
    }

    /// Finalize the stream: emit trailing data, persist properties, and
    /// deregister from the volume set.  Idempotent.
    pub fn close(&mut self) -> Result<()> {
        match self {
            Stream::Image(s) => s.close(),
            Stream::Map(s) => s.close(),
            Stream::Overlay(s) => s.close(),
            Stream::Encrypted(s) => s.close(),
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MapStream> {
        match self {
            Stream::Map(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_overlay_mut(&mut self) -> Option<&mut OverlayStream> {
        match self {
            Stream::Overlay(s) => Some(s),
            _ => None,
        }
    }
}

// std::io adapters, so a stream can back a nested volume or feed any
// reader-shaped consumer.
impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(to_io)
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf).map_err(to_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Stream::flush(self).map_err(to_io)
    }
}

impl io::Seek for Stream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.tell() as i64 + d,
            SeekFrom::End(d) => self.size() as i64 + d,
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before stream start"));
        }
        self.seek_to(target as u64).map_err(to_io)?;
        Ok(target as u64)
    }
}

fn to_io(e: Error) -> io::Error {
    match e {
        Error::Io(io) => io,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

// ── Target resolution ────────────────────────────────────────────────────────

/// Where a Map or Overlay target lives: `file://` means an external file,
/// anything else is a stream in the same archive set.
pub(crate) enum Target {
    Stream(Stream),
    External(File),
}

impl Target {
    pub(crate) fn resolve(set: &VolumeSet, url: &str) -> Result<Target> {
        if let Some(name) = url.strip_prefix("file://") {
            let path = set.resolve_external_path(name);
            Ok(Target::External(File::open(&path).map_err(|e| {
                Error::Io(io::Error::new(e.kind(), format!("{}: {e}", path.display())))
            })?))
        } else {
            Ok(Target::Stream(set.open_stream(url)?))
        }
    }

    /// Seek to `offset` and read up to `buf.len()` bytes; short at EOF.
    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Target::Stream(s) => {
                s.seek_to(offset)?;
                s.read(buf)
            }
            Target::External(f) => {
                f.seek(SeekFrom::Start(offset))?;
                let mut done = 0;
                while done < buf.len() {
                    match f.read(&mut buf[done..]) {
                        Ok(0) => break,
                        Ok(n) => done += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(done)
            }
        }
    }
}

// ── Volume-set entry points ──────────────────────────────────────────────────

impl VolumeSet {
    /// Open `<name>` for reading, dispatching on its `type` property.
    pub fn open_stream(&self, name: &str) -> Result<Stream> {
        let raw = self.read_member(&format!("{name}/properties"))?;
        let props = Properties::from_text(&String::from_utf8_lossy(&raw));
        let type_name = props
            .get("type")
            .ok_or_else(|| Error::integrity(format!("stream {name} has no type property")))?;
        let ty = StreamType::from_name(type_name)
            .ok_or_else(|| Error::integrity(format!("unknown stream type {type_name:?}")))?;

        Ok(match ty {
            StreamType::Image => Stream::Image(ImageStream::open(self, name, props)?),
            StreamType::Map => Stream::Map(MapStream::open(self, name, props)?),
            StreamType::Overlay => Stream::Overlay(OverlayStream::open(self, name, props)?),
            StreamType::Encrypted => Stream::Encrypted(EncryptedStream::open(self, name, props)?),
        })
    }

    /// Create `<name>` for writing with the given driver.  The returned
    /// stream registers itself as an outstanding writer and must be closed
    /// before the parent volume is.
    pub fn create_stream_for_writing(
        &self,
        name: &str,
        ty: StreamType,
        props: Properties,
    ) -> Result<Stream> {
        Ok(match ty {
            StreamType::Image => Stream::Image(ImageStream::create(self, name, props)?),
            StreamType::Map => Stream::Map(MapStream::create(self, name, props)?),
            StreamType::Overlay => Stream::Overlay(OverlayStream::create(self, name, props)?),
            StreamType::Encrypted => Stream::Encrypted(EncryptedStream::create(self, name, props)?),
        })
    }
}

/// Shared by the chunked drivers: register a core with the volume set.
pub(crate) fn register<C: StreamFlush + 'static>(
    set: &VolumeSet,
    name: &str,
    core: &Rc<std::cell::RefCell<C>>,
) {
    let dyn_core: Rc<std::cell::RefCell<dyn StreamFlush>> = core.clone();
    let weak: std::rc::Weak<std::cell::RefCell<dyn StreamFlush>> = Rc::downgrade(&dyn_core);
    set.register_writer(name, weak);
}
