//! Crate-wide error type.
//!
//! One enum covers the whole container stack.  The split follows the failure
//! policy, not the module layout: structural problems (`Integrity`) abort the
//! operation, per-line problems in user data (`Parse`) are skipped by the
//! caller, and I/O errors pass through unchanged.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// UUID mismatch between volumes, malformed ZIP structure, or a CRC-32
    /// mismatch on a member read.  The archive cannot be trusted.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A second member was opened for writing while the volume write lock is
    /// held.  Carries the name of the member holding the lock.
    #[error("volume is locked for writing member {0}")]
    Locked(String),

    /// The member name is absent from the consolidated index.
    #[error("member not found: {0}")]
    NotFound(String),

    /// Random access on a deflate member, seek on a compressed writer, or a
    /// write on a driver that does not accept byte writes.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A malformed properties, map, or overlay line.  Callers reading user
    /// data skip these per line; the variant escapes only from APIs that are
    /// documented to fail.
    #[error("parse error ({reason}): {line:?}")]
    Parse { line: String, reason: &'static str },

    /// A write was attempted with no active writable volume.
    #[error("no writable volume — call create_new_volume() or append_volume() first")]
    NoWritableVolume,

    #[error("crypto scheme {0:?} is not implemented")]
    UnknownScheme(String),

    /// No passphrase could be obtained for an encrypted stream.
    #[error("no key material available for stream {0:?}")]
    MissingKey(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Convenience constructor used by the ZIP layer.
    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }
}
