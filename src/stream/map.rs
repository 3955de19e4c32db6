//! The Map driver — a piecewise-linear, optionally periodic transformation
//! of one or more target streams into a new logical stream.
//!
//! # Points
//!
//! The mapping is a sorted list of `(file_offset, image_offset, target)`
//! triples, unique by file offset.  Between points the image offset advances
//! linearly with the file offset; a point is only needed where that linear
//! run breaks.  `file_period` / `image_period` repeat the point list over a
//! fixed logical period, advancing every target by `image_period` bytes per
//! repetition — the RAID reconstruction case.
//!
//! # Wire form
//!
//! `<stream>/map` is a deflated text member, one `"<file> <image> <target>"`
//! line per point, `#` comments ignored, whitespace one or more tabs or
//! spaces.  Malformed lines are skipped.  The `target` property array lists
//! target URLs in index order.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::volume::VolumeSet;
use crate::zip::CompressionMethod;

use super::{register, StreamFlush, StreamType, Target};

/// One mapping point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapPoint {
    pub file_offset:  u64,
    pub image_offset: u64,
    pub target:       usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

struct MapCore {
    set:          VolumeSet,
    name:         String,
    mode:         Mode,
    properties:   Properties,
    points:       Vec<MapPoint>,
    target_urls:  Vec<String>,
    targets:      Vec<Target>, // resolved in read mode only
    size:         u64,
    readptr:      u64,
    file_period:  Option<u64>,
    image_period: u64,
    map_dirty:    bool,
    closed:       bool,
}

impl MapCore {
    fn new(set: &VolumeSet, name: &str, mode: Mode, properties: Properties) -> Result<Self> {
        let target_urls: Vec<String> = properties.get_array("target").to_vec();
        if target_urls.is_empty() {
            return Err(Error::integrity(format!(
                "map stream {name} declares no targets"
            )));
        }

        // Opening a target we are concurrently writing would corrupt it, so
        // targets resolve only for reading.
        let targets = match mode {
            Mode::Read => target_urls
                .iter()
                .map(|u| Target::resolve(set, u))
                .collect::<Result<Vec<_>>>()?,
            Mode::Write => Vec::new(),
        };

        let size = match properties.get("size") {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Parse { line: v.to_owned(), reason: "size" })?,
            None => 0,
        };
        let (file_period, image_period) =
            match (properties.get("file_period"), properties.get("image_period")) {
                (Some(f), Some(i)) => {
                    let fp = f
                        .parse()
                        .map_err(|_| Error::Parse { line: f.to_owned(), reason: "file_period" })?;
                    let ip = i
                        .parse()
                        .map_err(|_| Error::Parse { line: i.to_owned(), reason: "image_period" })?;
                    (Some(fp), ip)
                }
                _ => (None, 0),
            };

        Ok(Self {
            set: set.clone(),
            name: name.to_owned(),
            mode,
            properties,
            points: Vec::new(),
            target_urls,
            targets,
            size,
            readptr: 0,
            file_period,
            image_period,
            map_dirty: false,
            closed: false,
        })
    }

    // ── Point editing ────────────────────────────────────────────────────────

    /// Insert a point; a point at the same file offset is replaced.
    fn add_point(&mut self, file_offset: u64, image_offset: u64, target: usize) {
        let point = MapPoint { file_offset, image_offset, target };
        match self.points.binary_search_by_key(&file_offset, |p| p.file_offset) {
            Ok(i) => self.points[i] = point,
            Err(i) => self.points.insert(i, point),
        }
        self.map_dirty = true;
    }

    fn del_point(&mut self, file_offset: u64) {
        if let Ok(i) = self.points.binary_search_by_key(&file_offset, |p| p.file_offset) {
            self.points.remove(i);
            self.map_dirty = true;
        }
    }

    /// Keep only discontinuities: the first point always survives; every
    /// later point is dropped when both its image offset matches the linear
    /// continuation of the previous kept point and its target is unchanged.
    fn pack(&mut self) {
        if self.points.len() < 2 {
            return;
        }
        let mut kept = vec![self.points[0]];
        let mut last = self.points[0];
        for p in &self.points[1..] {
            let predicted = last.image_offset + (p.file_offset - last.file_offset);
            if p.image_offset != predicted || p.target != last.target {
                kept.push(*p);
                last = *p;
            }
            // A dropped point sits exactly on the line from `last`, so
            // extrapolating from either gives the same prediction.
        }
        if kept.len() != self.points.len() {
            self.points = kept;
            self.map_dirty = true;
        }
    }

    // ── Interpolation ────────────────────────────────────────────────────────

    /// Map a logical offset to `(image_offset, run, target)`.  `run` is the
    /// byte count until the next discontinuity (or period edge) — a caller
    /// may read that many bytes from the target without re-interpolating.
    fn interpolate(&self, file_offset: u64) -> Result<(u64, u64, usize)> {
        if self.points.is_empty() {
            return Err(Error::integrity(format!(
                "map stream {} has no points",
                self.name
            )));
        }

        let (period, offset, file_period, image_period) = match self.file_period {
            Some(fp) if fp > 0 => (file_offset / fp, file_offset % fp, fp, self.image_period),
            _ => (0, file_offset, self.size, 0),
        };

        let first = self.points[0].file_offset;
        let last = self.points[self.points.len() - 1].file_offset;
        // Before the first point only backward interpolation is defined;
        // after the last, only forward.
        let forward = offset >= first || offset > last;

        let (point, image_offset, run) = if forward {
            let l = self.points.partition_point(|p| p.file_offset <= offset) - 1;
            let point = self.points[l];
            let image_offset = point.image_offset + (offset - point.file_offset);
            let run = match self.points.get(l + 1) {
                Some(next) => next.file_offset - offset,
                None => file_period.saturating_sub(offset),
            };
            (point, image_offset, run)
        } else {
            let r = self.points.partition_point(|p| p.file_offset <= offset);
            let point = self.points[r];
            let image_offset = point
                .image_offset
                .checked_sub(point.file_offset - offset)
                .ok_or_else(|| {
                    Error::integrity(format!(
                        "map stream {}: backward interpolation before image start at offset {offset}",
                        self.name
                    ))
                })?;
            (point, image_offset, point.file_offset - offset)
        };

        Ok((image_offset + period * image_period, run, point.target))
    }

    // ── Read path ────────────────────────────────────────────────────────────

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode == Mode::Write {
            return Err(Error::Unsupported("read on a map stream opened for writing"));
        }
        let remaining = self.size.saturating_sub(self.readptr);
        let want = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0;
        while done < want {
            let (image_offset, run, target) = self.interpolate(self.readptr)?;
            if run == 0 {
                break;
            }
            let fd = self.targets.get_mut(target).ok_or_else(|| {
                Error::integrity(format!("map point references missing target {target}"))
            })?;
            let step = (run.min((want - done) as u64)) as usize;
            let n = fd.read_at(image_offset, &mut buf[done..done + step])?;
            if n == 0 {
                break; // short read from a target ends the stream read
            }
            done += n;
            self.readptr += n as u64;
        }
        Ok(done)
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    fn load_map(&mut self) -> Result<()> {
        let raw = match self.set.read_member(&format!("{}/map", self.name)) {
            Ok(raw) => raw,
            Err(Error::NotFound(_)) => return Ok(()), // a fully empty map is allowed
            Err(e) => return Err(e),
        };
        let text = String::from_utf8_lossy(&raw);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_ascii_whitespace();
            let parsed = (|| {
                let f = fields.next()?.parse().ok()?;
                let m = fields.next()?.parse().ok()?;
                let t = fields.next()?.parse().ok()?;
                Some((f, m, t))
            })();
            match parsed {
                Some((f, m, t)) => self.add_point(f, m, t),
                None => warn!(stream = %self.name, line, "skipping malformed map line"),
            }
        }
        self.map_dirty = false;
        Ok(())
    }

    fn save_map(&mut self) -> Result<()> {
        let mut text = String::new();
        for p in &self.points {
            text.push_str(&format!("{} {} {}\n", p.file_offset, p.image_offset, p.target));
        }
        self.set.writestr(
            &format!("{}/map", self.name),
            text.as_bytes(),
            CompressionMethod::Deflate,
        )?;
        self.map_dirty = false;
        Ok(())
    }

    fn write_properties(&mut self, set: &VolumeSet) -> Result<()> {
        self.properties.set("type", StreamType::Map.name());
        self.properties.set("name", self.name.clone());
        self.properties.set("size", self.size.to_string());
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
            self.save_map()?;
            let set = self.set.clone();
            self.write_properties(&set)?;
            self.set.unregister_writer(&self.name);
        }
        Ok(())
    }
}

impl StreamFlush for MapCore {
    fn flush_into(&mut self, set: &VolumeSet) -> Result<()> {
        if self.mode == Mode::Write && !self.closed {
            self.write_properties(set)?;
        }
        Ok(())
    }
}

impl Drop for MapCore {
    fn drop(&mut self) {
        if self.mode == Mode::Write && !self.closed {
            if let Err(e) = self.close() {
                warn!(stream = %self.name, error = %e, "best-effort map close failed");
            }
        }
    }
}

// ── Public driver ────────────────────────────────────────────────────────────

/// A mapping stream — see the module docs.
pub struct MapStream {
    core: Rc<RefCell<MapCore>>,
}

impl MapStream {
    pub(crate) fn open(set: &VolumeSet, name: &str, props: Properties) -> Result<Self> {
        let mut core = MapCore::new(set, name, Mode::Read, props)?;
        core.load_map()?;
        Ok(Self { core: Rc::new(RefCell::new(core)) })
    }

    pub(crate) fn create(set: &VolumeSet, name: &str, props: Properties) -> Result<Self> {
        let core = Rc::new(RefCell::new(MapCore::new(set, name, Mode::Write, props)?));
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

    pub fn add_point(&mut self, file_offset: u64, image_offset: u64, target: usize) {
        self.core.borrow_mut().add_point(file_offset, image_offset, target);
    }

    pub fn del_point(&mut self, file_offset: u64) {
        self.core.borrow_mut().del_point(file_offset);
    }

    /// Drop every point that is a linear continuation of its predecessor.
    pub fn pack(&mut self) {
        self.core.borrow_mut().pack();
    }

    pub fn points(&self) -> Vec<MapPoint> {
        self.core.borrow().points.clone()
    }

    /// Target URLs in index order, as declared by the `target` property.
    pub fn target_urls(&self) -> Vec<String> {
        self.core.borrow().target_urls.clone()
    }

    /// `(image_offset, run, target)` for a logical offset.
    pub fn interpolate(&self, file_offset: u64) -> Result<(u64, u64, usize)> {
        self.core.borrow().interpolate(file_offset)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.core.borrow_mut().read(buf)
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.core.borrow_mut().readptr = pos;
        Ok(())
    }

    /// Persist the point list now, without closing.
    pub fn save_map(&mut self) -> Result<()> {
        self.core.borrow_mut().save_map()
    }

    pub fn flush(&mut self) -> Result<()> {
        let set = self.core.borrow().set.clone();
        self.core.borrow_mut().flush_into(&set)
    }

    pub fn close(&mut self) -> Result<()> {
        self.core.borrow_mut().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with_points(points: &[(u64, u64, usize)], size: u64) -> MapCore {
        let set = VolumeSet::new();
        let mut props = Properties::new();
        props.append("target", "t0");
        let mut core = MapCore::new(&set, "m", Mode::Write, props).unwrap();
        for &(f, m, t) in points {
            core.add_point(f, m, t);
        }
        core.size = size;
        core
    }

    #[test]
    fn forward_interpolation_and_runs() {
        let core = core_with_points(&[(0, 0, 0), (4, 0, 1)], 8);
        assert_eq!(core.interpolate(0).unwrap(), (0, 4, 0));
        assert_eq!(core.interpolate(3).unwrap(), (3, 1, 0));
        assert_eq!(core.interpolate(4).unwrap(), (0, 4, 1));
        assert_eq!(core.interpolate(7).unwrap(), (3, 1, 1));
    }

    #[test]
    fn backward_interpolation_before_first_point() {
        let core = core_with_points(&[(4, 10, 2)], 8);
        // Offsets below the first point run backward from it.
        assert_eq!(core.interpolate(2).unwrap(), (8, 2, 2));
    }

    #[test]
    fn periodic_interpolation_advances_by_image_period() {
        let mut core = core_with_points(&[(0, 0, 0), (3, 0, 1)], 12);
        core.file_period = Some(6);
        core.image_period = 6;
        for x in 0..6u64 {
            let (m0, _, t0) = core.interpolate(x).unwrap();
            let (m1, _, t1) = core.interpolate(x + 6).unwrap();
            assert_eq!(m1, m0 + 6);
            assert_eq!(t0, t1);
        }
    }

    #[test]
    fn run_never_crosses_a_discontinuity() {
        let core = core_with_points(&[(0, 0, 0), (5, 100, 0), (9, 0, 1)], 20);
        for x in 0..20u64 {
            let (_, run, _) = core.interpolate(x).unwrap();
            let next_break = [5u64, 9, 20].iter().copied().find(|&b| b > x).unwrap();
            assert!(x + run <= next_break, "run from {x} crosses {next_break}");
        }
    }

    #[test]
    fn pack_keeps_first_point_and_discontinuities() {
        let mut core = core_with_points(
            &[(0, 0, 0), (4, 4, 0), (8, 0, 1), (12, 4, 1), (16, 100, 1)],
            20,
        );
        core.pack();
        let kept: Vec<u64> = core.points.iter().map(|p| p.file_offset).collect();
        assert_eq!(kept, &[0, 8, 16]);
    }

    #[test]
    fn pack_keeps_target_changes_even_when_linear() {
        // Image offsets continue linearly but the target switches — the
        // point carries information and must survive.
        let mut core = core_with_points(&[(0, 0, 0), (4, 4, 1)], 8);
        core.pack();
        assert_eq!(core.points.len(), 2);
    }

    #[test]
    fn pack_single_point_is_kept() {
        let mut core = core_with_points(&[(3, 7, 0)], 8);
        core.pack();
        assert_eq!(core.points.len(), 1);
    }

    #[test]
    fn pack_is_idempotent() {
        let mut core = core_with_points(
            &[(0, 0, 0), (2, 2, 0), (4, 0, 1), (6, 2, 1), (8, 9, 0)],
            16,
        );
        core.pack();
        let once: Vec<MapPoint> = core.points.clone();
        core.pack();
        assert_eq!(core.points, once);
    }

    #[test]
    fn add_point_replaces_on_equal_offset() {
        let mut core = core_with_points(&[(0, 0, 0), (4, 8, 0)], 8);
        core.add_point(4, 99, 1);
        assert_eq!(core.points.len(), 2);
        assert_eq!(core.interpolate(4).unwrap(), (99, 4, 1));
    }

    use proptest::prelude::*;

    proptest! {
        /// Packing may only drop redundant points: the mapping function —
        /// image offset and target at every logical offset — stays the same,
        /// and packing twice changes nothing further.
        #[test]
        fn pack_preserves_the_mapping_function(
            raw in proptest::collection::vec((0u64..96, 64u64..256, 0usize..3), 1..24),
        ) {
            let mut core = core_with_points(&[], 128);
            for (f, m, t) in raw {
                core.add_point(f, m, t);
            }
            let probe = |core: &MapCore| -> Vec<Option<(u64, usize)>> {
                (0..128u64)
                    .map(|x| core.interpolate(x).map(|(m, _, t)| (m, t)).ok())
                    .collect()
            };
            let before = probe(&core);
            core.pack();
            prop_assert_eq!(before, probe(&core));

            let once = core.points.clone();
            core.pack();
            prop_assert_eq!(&core.points, &once);
        }
    }
}
