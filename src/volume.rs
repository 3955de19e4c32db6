//! The volume set — one logical archive over N ZIP64 volumes.
//!
//! # Consolidation rules (frozen)
//!
//! - Multiple CD entries for one member name: the entry with the later
//!   last-modified stamp wins; a tie goes to the later-loaded volume.
//! - An entry whose compressed and uncompressed sizes are both zero is a
//!   tombstone and deletes the name from the consolidated index.
//! - Every volume carries a top-level `properties` member, and every volume
//!   of one archive carries the same `UUID` (RFC 4122).  A mismatch aborts
//!   the load.
//!
//! # Handles
//!
//! `VolumeSet` is a cheap-clone handle over shared single-threaded state.
//! Stream drivers hold a clone and identify themselves by stream name; the
//! writer registry holds weak references, so the object graph stays acyclic.
//! At most one volume is writable at a time, and at most one member may be
//! open for streaming write (the volume write lock, keyed by member name).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::ChunkCache;
use crate::error::{Error, Result};
use crate::member::MemberStream;
use crate::properties::{Properties, CONTENT_TYPE, VERSION};
use crate::stream::{KeyProvider, StreamFlush};
use crate::zip::reader::{read_central_directory, resolve_data_offset};
use crate::zip::writer::{write_central_directory, write_local_header};
use crate::zip::{dos_datetime_now, CompressionMethod, EntryInfo};

/// Anything that can back a volume: a file on disk, an in-memory cursor, or
/// a stream inside another archive.
pub trait Backing: Read + Write + Seek {}
impl<T: Read + Write + Seek> Backing for T {}

// ── Internal state ───────────────────────────────────────────────────────────

struct Volume {
    /// Identity within the set: `file://name.zip` or an in-set stream name.
    url:       String,
    path:      Option<PathBuf>,
    file:      Box<dyn Backing>,
    /// This volume's own CD rows — kept so the directory can be re-emitted
    /// when the volume is appended to or closed.
    entries:   Vec<EntryInfo>,
    /// Where the CD begins; the append position when reopening.
    cd_offset: u64,
}

#[derive(Clone)]
struct IndexEntry {
    volume:            usize,
    header_offset:     u64,
    /// Lazily resolved offset of the first payload byte.
    data_offset:       Option<u64>,
    compressed_size:   u64,
    uncompressed_size: u64,
    crc32:             u32,
    method:            CompressionMethod,
    date_time:         (u16, u16),
}

struct SetState {
    volumes:    Vec<Volume>,
    index:      HashMap<String, IndexEntry>,
    properties: Properties,
    cache:      ChunkCache,
    write_lock: Option<String>,
    active:     Option<usize>,
    write_ptr:  u64,
    dirty:      bool,
    base_dir:   Option<PathBuf>,
}

struct WriterHook {
    name: String,
    hook: Weak<RefCell<dyn StreamFlush>>,
}

struct Shared {
    state:        RefCell<SetState>,
    writers:      RefCell<Vec<WriterHook>>,
    key_provider: RefCell<Option<Rc<dyn KeyProvider>>>,
}

// ── VolumeSet ────────────────────────────────────────────────────────────────

pub struct VolumeSet {
    shared: Rc<Shared>,
}

impl Clone for VolumeSet {
    fn clone(&self) -> Self {
        Self { shared: Rc::clone(&self.shared) }
    }
}

impl VolumeSet {
    /// An empty archive with a fresh RFC 4122 UUID.  Add a volume with
    /// [`create_new_volume`](Self::create_new_volume) before writing.
    pub fn new() -> Self {
        let set = Self::empty();
        {
            let mut st = set.shared.state.borrow_mut();
            st.properties.set("UUID", Uuid::new_v4().to_string());
        }
        set
    }

    /// An empty archive inheriting `parent`'s UUID — the child's volumes
    /// belong to the same logical set.
    pub fn new_child_of(parent: &VolumeSet) -> Result<Self> {
        let uuid = parent.uuid().ok_or_else(|| Error::integrity("parent archive has no UUID"))?;
        let set = Self::empty();
        set.shared.state.borrow_mut().properties.set("UUID", uuid);
        Ok(set)
    }

    fn empty() -> Self {
        let mut properties = Properties::new();
        properties.set("version", VERSION);
        properties.set("content-type", CONTENT_TYPE);
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(SetState {
                    volumes: Vec::new(),
                    index: HashMap::new(),
                    properties,
                    cache: ChunkCache::default(),
                    write_lock: None,
                    active: None,
                    write_ptr: 0,
                    dirty: false,
                    base_dir: None,
                }),
                writers: RefCell::new(Vec::new()),
                key_provider: RefCell::new(None),
            }),
        }
    }

    /// Open an archive over one or more volume files, then chase every
    /// `volume` cross-reference until the set is complete.  A UUID is minted
    /// only when no loaded volume supplies one.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let set = Self::empty();
        for p in paths {
            set.load_volume(p.as_ref())?;
        }
        set.load_referenced_volumes()?;
        {
            let mut st = set.shared.state.borrow_mut();
            if st.properties.get("UUID").is_none() {
                st.properties.set("UUID", Uuid::new_v4().to_string());
            }
        }
        Ok(set)
    }

    /// Merge one more volume file into the set.  Idempotent.
    pub fn load_volume(&self, path: &Path) -> Result<()> {
        let url = file_url(path);
        if self.is_loaded(&url) {
            return Ok(());
        }
        let file = File::open(path)
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
        {
            let mut st = self.shared.state.borrow_mut();
            if st.base_dir.is_none() {
                st.base_dir = path.parent().map(Path::to_path_buf);
            }
        }
        self.merge_volume(Box::new(file), url, Some(path.to_path_buf()))
    }

    /// Merge a volume carried by an arbitrary backing (e.g. a stream inside
    /// another archive).
    pub fn load_volume_backing(&self, backing: Box<dyn Backing>, url: &str) -> Result<()> {
        if self.is_loaded(url) {
            return Ok(());
        }
        self.merge_volume(backing, url.to_owned(), None)
    }

    fn is_loaded(&self, url: &str) -> bool {
        self.shared.state.borrow().volumes.iter().any(|v| v.url == url)
    }

    /// Parse a volume's CD, feed every row through the consolidation rules,
    /// and adopt its properties (UUID check included).
    fn merge_volume(&self, mut file: Box<dyn Backing>, url: String, path: Option<PathBuf>) -> Result<()> {
        debug!(volume = %url, "loading volume");
        let cd = read_central_directory(&mut file)?;

        let props_entry = cd
            .entries
            .iter()
            .rev()
            .find(|e| e.name == "properties" && !e.is_tombstone())
            .cloned()
            .ok_or_else(|| Error::integrity(format!("volume {url} has no properties member")))?;

        let volume_idx;
        {
            let mut st = self.shared.state.borrow_mut();
            volume_idx = st.volumes.len();
            st.volumes.push(Volume {
                url: url.clone(),
                path,
                file,
                entries: cd.entries.clone(),
                cd_offset: cd.cd_offset,
            });
            for entry in &cd.entries {
                update_index(&mut st, volume_idx, entry);
            }
        }

        // The volume's own properties member, read from this backing alone.
        let raw = self.read_entry_from(volume_idx, &props_entry)?;
        let p = Properties::from_text(&String::from_utf8_lossy(&raw));

        let volume_uuid = p
            .get("UUID")
            .ok_or_else(|| Error::integrity(format!("volume {url} carries no UUID")))?
            .to_owned();

        let mut st = self.shared.state.borrow_mut();
        match st.properties.get("UUID").map(str::to_owned) {
            Some(ours) if ours != volume_uuid => {
                return Err(Error::integrity(format!(
                    "volume {url} has UUID {volume_uuid}, the set has {ours}"
                )));
            }
            Some(_) => {}
            None => st.properties.set("UUID", volume_uuid),
        }

        st.properties.append("volume", url);
        st.properties.update(&p);
        Ok(())
    }

    /// Chase `volume` references until no unloaded ones remain.  `file://`
    /// entries resolve next to the first loaded volume; anything else is an
    /// in-set stream name opened through the stream layer.
    pub fn load_referenced_volumes(&self) -> Result<()> {
        loop {
            let next = {
                let st = self.shared.state.borrow();
                let loaded = |url: &str| st.volumes.iter().any(|v| v.url == url);
                let refs = st.properties.get_array("volume");
                refs.iter()
                    .find(|u| u.starts_with("file://") && !loaded(u))
                    .or_else(|| refs.iter().find(|u| !loaded(u)))
                    .cloned()
            };
            let Some(url) = next else { return Ok(()) };

            if let Some(name) = url.strip_prefix("file://") {
                let path = self.resolve_external_path(name);
                self.load_volume(&path)?;
            } else {
                let stream = self.open_stream(&url)?;
                self.load_volume_backing(Box::new(stream), &url)?;
            }
        }
    }

    /// Interpret a `file://` reference: absolute paths pass through, relative
    /// ones resolve next to the first loaded volume.
    pub(crate) fn resolve_external_path(&self, name: &str) -> PathBuf {
        let p = Path::new(name);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        match &self.shared.state.borrow().base_dir {
            Some(dir) => dir.join(p),
            None => p.to_path_buf(),
        }
    }

    // ── Identity and metadata ────────────────────────────────────────────────

    pub fn uuid(&self) -> Option<String> {
        self.shared.state.borrow().properties.get("UUID").map(str::to_owned)
    }

    /// Snapshot of the consolidated volume-level properties.
    pub fn properties(&self) -> Properties {
        self.shared.state.borrow().properties.clone()
    }

    pub fn contains_member(&self, name: &str) -> bool {
        self.shared.state.borrow().index.contains_key(name)
    }

    /// Names in the consolidated index, sorted.
    pub fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.shared.state.borrow().index.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_key_provider(&self, provider: Rc<dyn KeyProvider>) {
        *self.shared.key_provider.borrow_mut() = Some(provider);
    }

    pub(crate) fn key_provider(&self) -> Option<Rc<dyn KeyProvider>> {
        self.shared.key_provider.borrow().clone()
    }

    // ── Volume lifecycle ─────────────────────────────────────────────────────

    /// Close the current writable volume and start a new one at `path`
    /// (created or truncated).  The new volume immediately joins the set's
    /// `volume` list, so every later-closed volume enumerates the full set.
    pub fn create_new_volume(&self, path: &Path) -> Result<()> {
        let url = file_url(path);
        self.shared.state.borrow_mut().properties.append("volume", &url);
        self.close()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut st = self.shared.state.borrow_mut();
        if st.base_dir.is_none() {
            st.base_dir = path.parent().map(Path::to_path_buf);
        }
        let idx = st.volumes.len();
        st.volumes.push(Volume {
            url,
            path: Some(path.to_path_buf()),
            file: Box::new(file),
            entries: Vec::new(),
            cd_offset: 0,
        });
        st.active = Some(idx);
        st.write_ptr = 0;
        st.dirty = true; // even an untouched volume closes self-sufficient
        Ok(())
    }

    /// Like [`create_new_volume`](Self::create_new_volume) with a caller
    ///-supplied backing (used for nested or in-memory volumes).
    pub fn create_new_volume_backing(&self, backing: Box<dyn Backing>, url: &str) -> Result<()> {
        self.shared.state.borrow_mut().properties.append("volume", url);
        self.close()?;

        let mut st = self.shared.state.borrow_mut();
        let idx = st.volumes.len();
        st.volumes.push(Volume {
            url: url.to_owned(),
            path: None,
            file: backing,
            entries: Vec::new(),
            cd_offset: 0,
        });
        st.active = Some(idx);
        st.write_ptr = 0;
        st.dirty = true;
        Ok(())
    }

    /// Reopen an already-loaded volume for appending.  Writing resumes where
    /// its CD begins; the old directory is re-emitted on close.
    pub fn append_volume(&self, path: &Path) -> Result<()> {
        let url = file_url(path);
        self.close()?;

        let mut st = self.shared.state.borrow_mut();
        let idx = st
            .volumes
            .iter()
            .position(|v| v.url == url)
            .ok_or_else(|| Error::integrity(format!("{url} is not part of this archive set")))?;

        let reopen = st.volumes[idx].path.clone().unwrap_or_else(|| path.to_path_buf());
        let file = OpenOptions::new().read(true).write(true).open(&reopen)?;
        st.volumes[idx].file = Box::new(file);
        st.write_ptr = st.volumes[idx].cd_offset;
        st.active = Some(idx);
        st.dirty = false; // nothing to finalize until a member is written
        Ok(())
    }

    /// Finalize the writable volume: flush every registered stream writer,
    /// write the volume `properties` member, and emit the Central Directory.
    /// The volume then stays in the set read-only.  No-op when nothing is
    /// open for writing.
    pub fn close(&self) -> Result<()> {
        {
            let st = self.shared.state.borrow();
            if st.active.is_none() || !st.dirty {
                return Ok(());
            }
            if let Some(holder) = &st.write_lock {
                return Err(Error::Locked(holder.clone()));
            }
        }

        self.flush_writers()?;

        let props_text = {
            let mut st = self.shared.state.borrow_mut();
            if st.properties.get("UUID").is_none() {
                st.properties.set("UUID", Uuid::new_v4().to_string());
            }
            st.properties.to_text()
        };
        self.writestr("properties", props_text.as_bytes(), CompressionMethod::Stored)?;

        let mut st = self.shared.state.borrow_mut();
        let Some(idx) = st.active.take() else {
            return Err(Error::NoWritableVolume);
        };
        let cd_offset = st.write_ptr;
        let vol = &mut st.volumes[idx];
        vol.file.seek(SeekFrom::Start(cd_offset))?;
        let entries = std::mem::take(&mut vol.entries);
        write_central_directory(&mut vol.file, &entries, cd_offset)?;
        vol.file.flush()?;
        vol.entries = entries;
        vol.cd_offset = cd_offset;
        debug!(volume = %vol.url, "volume closed");
        st.dirty = false;
        Ok(())
    }

    /// Ask every registered stream writer to emit a self-sufficient copy of
    /// its stream properties into the current volume.
    pub fn flush_writers(&self) -> Result<()> {
        let hooks: Vec<(String, Rc<RefCell<dyn StreamFlush>>)> = self
            .shared
            .writers
            .borrow()
            .iter()
            .filter_map(|w| w.hook.upgrade().map(|h| (w.name.clone(), h)))
            .collect();
        for (name, hook) in hooks {
            debug!(stream = %name, "flushing stream writer");
            hook.borrow_mut().flush_into(self)?;
        }
        Ok(())
    }

    pub(crate) fn register_writer(&self, name: &str, hook: Weak<RefCell<dyn StreamFlush>>) {
        self.shared.writers.borrow_mut().push(WriterHook { name: name.to_owned(), hook });
    }

    pub(crate) fn unregister_writer(&self, name: &str) {
        self.shared.writers.borrow_mut().retain(|w| w.name != name);
    }

    // ── Member reads ─────────────────────────────────────────────────────────

    /// Whole-member read through the chunk cache.  Deflate members inflate
    /// here; the CRC from the directory is verified on every cache miss.
    pub fn read_member(&self, name: &str) -> Result<Vec<u8>> {
        let (entry, raw) = {
            let mut st = self.shared.state.borrow_mut();
            if let Some(bytes) = st.cache.get(name) {
                return Ok(bytes.to_vec());
            }
            let entry = st
                .index
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(name.to_owned()))?;
            let data_offset = resolve_entry_offset(&mut st, name, &entry)?;
            let vol = &mut st.volumes[entry.volume];
            let mut raw = vec![0u8; entry.compressed_size as usize];
            vol.file.seek(SeekFrom::Start(data_offset))?;
            vol.file.read_exact(&mut raw)?;
            (entry, raw)
        };

        let bytes = match entry.method {
            CompressionMethod::Stored => raw,
            CompressionMethod::Deflate => crate::zip::inflate(&raw)?,
        };

        let crc = crc32fast::hash(&bytes);
        if crc != entry.crc32 {
            return Err(Error::integrity(format!(
                "member {name}: CRC-32 mismatch (stored {:#010x}, computed {crc:#010x})",
                entry.crc32
            )));
        }

        self.shared.state.borrow_mut().cache.put(name, bytes.clone());
        Ok(bytes)
    }

    /// Random-access handle over a stored member.  Deflate members have no
    /// addressable interior and must go through [`read_member`](Self::read_member).
    pub fn open_member(&self, name: &str) -> Result<MemberStream> {
        let mut st = self.shared.state.borrow_mut();
        let entry = st
            .index
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        if entry.method != CompressionMethod::Stored {
            return Err(Error::Unsupported("random access on a deflate member"));
        }
        let data_offset = resolve_entry_offset(&mut st, name, &entry)?;
        drop(st);
        Ok(MemberStream::new_read(
            self.clone(),
            entry.volume,
            data_offset,
            entry.uncompressed_size,
        ))
    }

    // ── Member writes ────────────────────────────────────────────────────────

    /// Open a member for streaming write.  Takes the volume write lock; a
    /// second open fails with [`Error::Locked`] until the first closes.
    pub fn create_member(&self, name: &str, method: CompressionMethod) -> Result<MemberStream> {
        let mut st = self.shared.state.borrow_mut();
        if let Some(holder) = &st.write_lock {
            return Err(Error::Locked(holder.clone()));
        }
        let Some(idx) = st.active else {
            return Err(Error::NoWritableVolume);
        };

        let dos = dos_datetime_now();
        let header_offset = st.write_ptr;
        let mut header = Vec::with_capacity(crate::zip::LOCAL_FILE_HEADER_LEN + name.len());
        write_local_header(&mut header, name, method, dos)?;

        let write_ptr = st.write_ptr;
        let vol = &mut st.volumes[idx];
        vol.file.seek(SeekFrom::Start(write_ptr))?;
        vol.file.write_all(&header)?;
        st.write_ptr += header.len() as u64;
        st.dirty = true;
        st.write_lock = Some(name.to_owned());
        drop(st);

        Ok(MemberStream::new_write(self.clone(), name.to_owned(), method, header_offset, dos))
    }

    /// Whole-buffer write: open, write, close.  The write lock is held only
    /// for the duration of the call.
    pub fn writestr(&self, name: &str, data: &[u8], method: CompressionMethod) -> Result<()> {
        let mut member = self.create_member(name, method)?;
        member.write(data)?;
        member.close()
    }

    /// Write a tombstone for `name` — both sizes zero — and drop it from the
    /// consolidated index.
    pub fn delete_member(&self, name: &str) -> Result<()> {
        self.writestr(name, &[], CompressionMethod::Stored)
    }

    // ── Plumbing used by MemberStream and the stream drivers ─────────────────

    /// Append raw bytes at the active volume's write pointer.
    pub(crate) fn raw_append(&self, data: &[u8]) -> Result<()> {
        let mut st = self.shared.state.borrow_mut();
        let Some(idx) = st.active else {
            return Err(Error::NoWritableVolume);
        };
        let write_ptr = st.write_ptr;
        let vol = &mut st.volumes[idx];
        vol.file.seek(SeekFrom::Start(write_ptr))?;
        vol.file.write_all(data)?;
        st.write_ptr += data.len() as u64;
        st.dirty = true;
        Ok(())
    }

    /// Exact read from one backing volume at an absolute offset.
    pub(crate) fn read_at_volume(&self, volume: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.shared.state.borrow_mut();
        let vol = &mut st.volumes[volume];
        vol.file.seek(SeekFrom::Start(offset))?;
        vol.file.read_exact(buf)?;
        Ok(buf.len())
    }

    /// Record a finished member: CD row, consolidated index, cache expiry,
    /// lock release.
    pub(crate) fn finish_member(&self, entry: EntryInfo) -> Result<()> {
        let mut st = self.shared.state.borrow_mut();
        let idx = st.active.ok_or(Error::NoWritableVolume)?;
        st.volumes[idx].entries.push(entry.clone());
        update_index(&mut st, idx, &entry);
        st.cache.expire(&entry.name);
        st.write_lock = None;
        Ok(())
    }

    /// Read one entry's payload straight from a specific volume, bypassing
    /// the consolidated index (used while merging that volume's CD).
    fn read_entry_from(&self, volume: usize, entry: &EntryInfo) -> Result<Vec<u8>> {
        let raw = {
            let mut st = self.shared.state.borrow_mut();
            let vol = &mut st.volumes[volume];
            let data_offset = resolve_data_offset(&mut vol.file, entry.header_offset)?;
            let mut raw = vec![0u8; entry.compressed_size as usize];
            vol.file.seek(SeekFrom::Start(data_offset))?;
            vol.file.read_exact(&mut raw)?;
            raw
        };
        match entry.method {
            CompressionMethod::Stored => Ok(raw),
            CompressionMethod::Deflate => crate::zip::inflate(&raw),
        }
    }
}

impl Default for VolumeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VolumeSet {
    fn drop(&mut self) {
        // Last handle out finalizes the volume, best effort.
        if Rc::strong_count(&self.shared) == 1 {
            if let Err(e) = self.close() {
                warn!(error = %e, "best-effort volume close failed; volume recoverable by prefix scan only");
            }
        }
    }
}

// ── Consolidation helpers ────────────────────────────────────────────────────

/// Apply the override and tombstone rules for one CD row.
fn update_index(st: &mut SetState, volume: usize, entry: &EntryInfo) {
    if let Some(existing) = st.index.get(&entry.name) {
        if existing.date_time > entry.date_time() {
            return; // strictly newer entry stays; ties go to the newcomer
        }
    }
    if entry.is_tombstone() {
        if st.index.remove(&entry.name).is_some() {
            debug!(member = %entry.name, "tombstone removed member from index");
        }
        st.cache.expire(&entry.name);
        return;
    }
    // The winning entry may carry different bytes than whatever was cached.
    st.cache.expire(&entry.name);
    st.index.insert(
        entry.name.clone(),
        IndexEntry {
            volume,
            header_offset: entry.header_offset,
            data_offset: None,
            compressed_size: entry.compressed_size,
            uncompressed_size: entry.uncompressed_size,
            crc32: entry.crc32,
            method: entry.method,
            date_time: entry.date_time(),
        },
    );
}

/// Resolve (and memoize) the payload offset for an index row.
fn resolve_entry_offset(st: &mut SetState, name: &str, entry: &IndexEntry) -> Result<u64> {
    if let Some(off) = entry.data_offset {
        return Ok(off);
    }
    let off = resolve_data_offset(&mut st.volumes[entry.volume].file, entry.header_offset)?;
    if let Some(row) = st.index.get_mut(name) {
        row.data_offset = Some(off);
    }
    Ok(off)
}

/// The in-set identity of a volume file: `file://` plus its base name.
fn file_url(path: &Path) -> String {
    match path.file_name() {
        Some(n) => format!("file://{}", n.to_string_lossy()),
        None => format!("file://{}", path.display()),
    }
}
