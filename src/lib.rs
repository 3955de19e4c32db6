//! # fif — FIF forensic image container, reference implementation
//!
//! A FIF archive is a logical set of ZIP64 volumes sharing one UUID.  The
//! volumes' Central Directories consolidate into a single namespace; on top
//! of that namespace sit seekable stream drivers for chunked images,
//! RAID-style mappings, external-file overlays, and block-encrypted images.
//!
//! Format guarantees (frozen in FIF 1.0):
//! - Every volume is a standalone ZIP64 file: top-level `properties` member,
//!   valid Central Directory, `UUID` identical across the set
//! - Duplicate member names resolve by latest last-modified stamp; ties go
//!   to the later-loaded volume
//! - A CD entry with both sizes zero is a tombstone and deletes the name
//! - Members stream with flag bit 3 and a 12-byte trailing data descriptor;
//!   the CD rewritten on close is the single authoritative index
//! - Properties are `key=value` lines, keys case-insensitive, value order
//!   preserved; binary values are base64
//! - Image chunks are `<stream>/<NNNNNNNN>.dd`, deflated, `chunk_size`
//!   bytes each except possibly the last
//! - Encrypted chunks are stored raw; the plaintext boundary of the final
//!   chunk is recovered from the stream `size`, never from a pad length

pub mod cache;
pub mod error;
pub mod member;
pub mod properties;
pub mod stream;
pub mod volume;
pub mod zip;

// Flat re-exports for the most common types.
pub use cache::{ChunkCache, DEFAULT_CACHE_LIMIT};
pub use error::{Error, Result};
pub use member::MemberStream;
pub use properties::{Properties, CONTENT_TYPE, VERSION};
pub use stream::{
    EncryptedStream, EnvKeyProvider, ImageStream, KeyProvider, MapStream, OverlayStream,
    StaticKeyProvider, Stream, StreamType, DEFAULT_CHUNK_SIZE,
};
pub use volume::{Backing, VolumeSet};
pub use zip::{CompressionMethod, EntryInfo};
