//! The `properties` member format — an ordered multi-map.
//!
//! # Wire form
//!
//! UTF-8 text, one `key=value` pair per line, first `=` separates, no
//! escaping.  Keys are ASCII case-insensitive (the first spelling seen is the
//! one written back); values are case-sensitive.  A key may carry several
//! values; their relative order is preserved and meaningful (`target` and
//! `volume` are arrays).  Binary values are base64-encoded by convention
//! (`salt`).
//!
//! Reserved keys: `UUID`, `version`, `type`, `size`, `name`, `count`,
//! `chunk_size`, `volume`, `target`, `scheme`, `salt`, `file_period`,
//! `image_period`, `content-type`.

use tracing::warn;

/// Version string carried by every volume-level `properties` member.
pub const VERSION: &str = "FIF 1.0";

/// MIME type marking a member that contains a nested FIF volume.
pub const CONTENT_TYPE: &str = "application/x-fif-file";

#[derive(Debug, Clone)]
struct Entry {
    key:    String,
    values: Vec<String>,
}

/// Ordered multi-map `key → [value, …]` with line-based serialization.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    entries: Vec<Entry>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the text form.  Empty lines and lines without a `=` are skipped
    /// (the latter with a warning); everything else appends in order.
    pub fn from_text(text: &str) -> Self {
        let mut props = Self::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((k, v)) => props.append(k, v),
                None => warn!(line, "skipping properties line without '='"),
            }
        }
        props
    }

    /// Serialize: for each key in first-insertion order, one `key=value\n`
    /// line per value.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            for v in &e.values {
                out.push_str(&e.key);
                out.push('=');
                out.push_str(v);
                out.push('\n');
            }
        }
        out
    }

    fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key.eq_ignore_ascii_case(key))
    }

    fn entry_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.key.eq_ignore_ascii_case(key))
    }

    /// First value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entry(key).and_then(|e| e.values.first()).map(String::as_str)
    }

    /// First value under `key`, or `default`.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// All values under `key`, in order of appearance.  Empty when absent.
    pub fn get_array(&self, key: &str) -> &[String] {
        self.entry(key).map(|e| e.values.as_slice()).unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    /// Replace every value under `key` with the single `value`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entry_mut(key) {
            Some(e) => e.values = vec![value],
            None => self.entries.push(Entry { key: key.to_owned(), values: vec![value] }),
        }
    }

    /// Add `value` under `key` unless that exact value is already present.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entry_mut(key) {
            Some(e) => {
                if !e.values.contains(&value) {
                    e.values.push(value);
                }
            }
            None => self.entries.push(Entry { key: key.to_owned(), values: vec![value] }),
        }
    }

    /// Append every non-duplicate value of `other`, preserving its order.
    pub fn update(&mut self, other: &Properties) {
        for (k, v) in other.iter() {
            self.append(k, v);
        }
    }

    /// Remove every value under `key`.  Silent when absent.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|e| !e.key.eq_ignore_ascii_case(key));
    }

    /// `(key, value)` pairs in serialization order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|e| e.values.iter().map(move |v| (e.key.as_str(), v.as_str())))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_value_order() {
        let text = "UUID=abcd\nvolume=file://a.zip\nvolume=file://b.zip\ntarget=s0\n";
        let p = Properties::from_text(text);
        assert_eq!(p.get("uuid"), Some("abcd"));
        assert_eq!(p.get_array("volume"), &["file://a.zip", "file://b.zip"]);
        assert_eq!(p.to_text(), text);
    }

    #[test]
    fn first_equals_sign_separates() {
        let p = Properties::from_text("name=a=b=c\n");
        assert_eq!(p.get("name"), Some("a=b=c"));
    }

    #[test]
    fn keys_are_case_insensitive_values_are_not() {
        let mut p = Properties::new();
        p.set("Type", "Image");
        assert_eq!(p.get("TYPE"), Some("Image"));
        p.append("type", "Image");
        assert_eq!(p.get_array("type").len(), 1);
        p.append("type", "image");
        assert_eq!(p.get_array("type").len(), 2);
    }

    #[test]
    fn bad_lines_are_skipped() {
        let p = Properties::from_text("good=1\nthis line has no separator\n\nalso=2\n");
        assert_eq!(p.get("good"), Some("1"));
        assert_eq!(p.get("also"), Some("2"));
        assert_eq!(p.iter().count(), 2);
    }

    #[test]
    fn set_replaces_update_merges() {
        let mut p = Properties::new();
        p.append("volume", "a");
        p.append("volume", "b");
        p.set("volume", "c");
        assert_eq!(p.get_array("volume"), &["c"]);

        let mut other = Properties::new();
        other.append("volume", "c");
        other.append("volume", "d");
        other.append("size", "13");
        p.update(&other);
        assert_eq!(p.get_array("volume"), &["c", "d"]);
        assert_eq!(p.get("size"), Some("13"));
    }
}
