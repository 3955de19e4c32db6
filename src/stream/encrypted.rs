//! The Encrypted driver — per-chunk block encryption over the Image core.
//!
//! # Scheme `aes-sha-psk`
//!
//! - master key  = `SHA1(PSK ‖ salt)[..16]`
//! - `salt`      = 8 random bytes, minted on first write, persisted base64
//! - chunk IV    = `SHA1(LE32(chunk_index) ‖ master_key)[..16]`
//! - cipher      = AES-128-CBC, plaintext padded to the 16-byte boundary
//!                 with `0xFF`
//!
//! No pad length is stored: the plaintext boundary of the final chunk is
//! recovered solely from the stream `size` property.  Chunks are written
//! with `Stored` compression — ciphertext does not deflate.
//!
//! # Key material
//!
//! The passphrase is taken from the `FIF_PSK` environment variable, then
//! from the transient `PSK` property (cleared before properties are ever
//! persisted), then from the injected [`KeyProvider`].  The library never
//! reads stdin.

use std::cell::RefCell;
use std::rc::Rc;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::volume::VolumeSet;

use super::image::{ImageCore, Mode};
use super::StreamType;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 16;
const SALT_LEN: usize = 8;

// ── Key acquisition ──────────────────────────────────────────────────────────

/// Injectable passphrase source — the "ask the operator" seam.
pub trait KeyProvider {
    /// A passphrase for the named stream, or `None` when unavailable.
    fn passphrase(&self, stream_name: &str) -> Option<String>;
}

/// Provider backed by an environment variable (default `FIF_PSK`).
pub struct EnvKeyProvider {
    pub variable: &'static str,
}

impl Default for EnvKeyProvider {
    fn default() -> Self {
        Self { variable: "FIF_PSK" }
    }
}

impl KeyProvider for EnvKeyProvider {
    fn passphrase(&self, _stream_name: &str) -> Option<String> {
        std::env::var(self.variable).ok()
    }
}

/// Provider returning a fixed passphrase — scripting and tests.
pub struct StaticKeyProvider(pub String);

impl KeyProvider for StaticKeyProvider {
    fn passphrase(&self, _stream_name: &str) -> Option<String> {
        Some(self.0.clone())
    }
}

fn resolve_psk(set: &VolumeSet, stream_name: &str, props: &mut Properties) -> Result<String> {
    if let Ok(psk) = std::env::var("FIF_PSK") {
        debug!(stream = stream_name, "PSK taken from environment");
        return Ok(psk);
    }
    if let Some(psk) = props.get("PSK").map(str::to_owned) {
        // Never let key material reach the persisted properties.
        props.remove("PSK");
        return Ok(psk);
    }
    if let Some(provider) = set.key_provider() {
        if let Some(psk) = provider.passphrase(stream_name) {
            return Ok(psk);
        }
    }
    Err(Error::MissingKey(stream_name.to_owned()))
}

// ── Cipher schemes ───────────────────────────────────────────────────────────

/// Per-chunk transform keyed by chunk index.  The registry is
/// [`build_scheme`]; adding a scheme means adding an arm there.
pub(crate) trait CipherScheme {
    fn encrypt_block(&self, index: u64, plain: &[u8]) -> Result<Vec<u8>>;
    fn decrypt_block(&self, index: u64, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// Identity scheme.
struct NullScheme;

impl CipherScheme for NullScheme {
    fn encrypt_block(&self, _index: u64, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn decrypt_block(&self, _index: u64, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

struct AesShaPsk {
    master_key: [u8; KEY_SIZE],
}

impl AesShaPsk {
    fn init(set: &VolumeSet, stream_name: &str, props: &mut Properties, mode: Mode) -> Result<Self> {
        let salt = match props.get("salt") {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|_| Error::integrity("salt is not valid base64"))?,
            None => {
                if mode == Mode::Read {
                    return Err(Error::integrity(format!(
                        "encrypted stream {stream_name} has no salt"
                    )));
                }
                let mut salt = vec![0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                props.set("salt", BASE64.encode(&salt));
                salt
            }
        };

        let psk = resolve_psk(set, stream_name, props)?;
        Ok(Self { master_key: derive_master_key(&psk, &salt) })
    }

    fn chunk_iv(&self, index: u64) -> [u8; BLOCK_SIZE] {
        let mut h = Sha1::new();
        h.update((index as u32).to_le_bytes());
        h.update(self.master_key);
        let digest = h.finalize();
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&digest[..BLOCK_SIZE]);
        iv
    }
}

fn derive_master_key(psk: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut h = Sha1::new();
    h.update(psk.as_bytes());
    h.update(salt);
    let digest = h.finalize();
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}

impl CipherScheme for AesShaPsk {
    fn encrypt_block(&self, index: u64, plain: &[u8]) -> Result<Vec<u8>> {
        let mut padded = plain.to_vec();
        let tail = padded.len() % BLOCK_SIZE;
        if tail != 0 {
            padded.resize(padded.len() + BLOCK_SIZE - tail, 0xFF);
        }
        let iv = self.chunk_iv(index);
        let enc = Aes128CbcEnc::new(&self.master_key.into(), &iv.into());
        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(&padded))
    }

    fn decrypt_block(&self, index: u64, sealed: &[u8]) -> Result<Vec<u8>> {
        let iv = self.chunk_iv(index);
        let dec = Aes128CbcDec::new(&self.master_key.into(), &iv.into());
        dec.decrypt_padded_vec_mut::<NoPadding>(sealed)
            .map_err(|_| Error::integrity("ciphertext chunk is not block-aligned"))
    }
}

fn build_scheme(
    name: &str,
    set: &VolumeSet,
    stream_name: &str,
    props: &mut Properties,
    mode: Mode,
) -> Result<Box<dyn CipherScheme>> {
    match name {
        "null" => Ok(Box::new(NullScheme)),
        "aes-sha-psk" => Ok(Box::new(AesShaPsk::init(set, stream_name, props, mode)?)),
        other => Err(Error::UnknownScheme(other.to_owned())),
    }
}

// ── Public driver ────────────────────────────────────────────────────────────

/// An Image stream whose chunks are independently encrypted — see the
/// module docs for the wire scheme.
pub struct EncryptedStream {
    core: Rc<RefCell<ImageCore>>,
}

impl EncryptedStream {
    pub(crate) fn open(set: &VolumeSet, name: &str, mut props: Properties) -> Result<Self> {
        let scheme = props.get_or("scheme", "null").to_owned();
        let cipher = build_scheme(&scheme, set, name, &mut props, Mode::Read)?;
        Ok(Self {
            core: ImageCore::new(set, name, Mode::Read, StreamType::Encrypted, props, Some(cipher))?,
        })
    }

    pub(crate) fn create(set: &VolumeSet, name: &str, mut props: Properties) -> Result<Self> {
        if props.get("scheme").is_none() {
            debug!(stream = name, "no scheme specified, defaulting to null");
            props.set("scheme", "null");
        }
        let scheme = props.get("scheme").unwrap_or("null").to_owned();
        let cipher = build_scheme(&scheme, set, name, &mut props, Mode::Write)?;
        Ok(Self {
            core: ImageCore::new(set, name, Mode::Write, StreamType::Encrypted, props, Some(cipher))?,
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

    pub fn flush(&mut self) -> Result<()> {
        let set = self.core.borrow().set_handle();
        self.core.borrow_mut().flush_into_set(&set)
    }

    pub fn close(&mut self) -> Result<()> {
        self.core.borrow_mut().close()
    }
}
