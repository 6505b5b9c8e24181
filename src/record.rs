//! Archive records and the enumeration adapter.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::UnpackError;
use crate::format::{ArchiveFormat, EnumerateMode, FileType, FormatError, Source};
use crate::progress::ProgressState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKey {
    OriginalName,
    CompressedSize,
    UncompressedSize,
    Crc,
    Method,
    ModifiedTime,
    IsFolder,
    Mode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Text(String),
    Number(u64),
    Flag(bool),
    Time(DateTime<Utc>),
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self { PropertyValue::Text(v) }
}
impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self { PropertyValue::Text(v.to_string()) }
}
impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self { PropertyValue::Number(v) }
}
impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self { PropertyValue::Flag(v) }
}
impl From<DateTime<Utc>> for PropertyValue {
    fn from(v: DateTime<Utc>) -> Self { PropertyValue::Time(v) }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s)   => f.write_str(s),
            PropertyValue::Number(n) => write!(f, "{n}"),
            PropertyValue::Flag(b)   => write!(f, "{b}"),
            PropertyValue::Time(t)   => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// Name shown for a record whose name property is missing or empty.
pub fn placeholder_name(index: usize) -> String {
    format!("record_{index}")
}

/// One entry of a container, described by whatever properties its format
/// knows.  Read-only once enumeration has returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveRecord {
    pub properties:    BTreeMap<PropertyKey, PropertyValue>,
    /// Where the entry starts in the container.
    pub stream_offset: u64,
    /// Bytes the entry occupies in the container; the size of last resort.
    pub stream_size:   u64,
}

impl ArchiveRecord {
    pub fn new(stream_offset: u64, stream_size: u64) -> Self {
        Self { properties: BTreeMap::new(), stream_offset, stream_size }
    }

    pub fn with(mut self, key: PropertyKey, value: impl Into<PropertyValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: PropertyKey, value: impl Into<PropertyValue>) {
        self.properties.insert(key, value.into());
    }

    pub fn property(&self, key: PropertyKey) -> Option<&PropertyValue> {
        self.properties.get(&key)
    }

    pub fn text(&self, key: PropertyKey) -> Option<&str> {
        match self.property(key)? {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn number(&self, key: PropertyKey) -> Option<u64> {
        match self.property(key)? {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn flag(&self, key: PropertyKey) -> Option<bool> {
        match self.property(key)? {
            PropertyValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn display_name(&self, index: usize) -> String {
        match self.text(PropertyKey::OriginalName) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => placeholder_name(index),
        }
    }

    /// Compressed size, or the stream size when the format reports none (or zero).
    pub fn compressed_size(&self) -> u64 {
        match self.number(PropertyKey::CompressedSize) {
            Some(n) if n > 0 => n,
            _ => self.stream_size,
        }
    }

    pub fn uncompressed_size(&self) -> Option<u64> {
        self.number(PropertyKey::UncompressedSize)
    }

    pub fn crc(&self) -> Option<u32> {
        self.number(PropertyKey::Crc).and_then(|c| u32::try_from(c).ok())
    }

    /// Uppercase hex without padding, or `-` when absent or zero.
    pub fn crc_display(&self) -> String {
        match self.crc() {
            Some(crc) if crc != 0 => format!("{crc:X}"),
            _ => "-".to_string(),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.flag(PropertyKey::IsFolder).unwrap_or(false)
    }
}

/// Run the archive's enumerator and materialise its record list.
///
/// Zero records is an error: an archive that yields nothing is reported as
/// empty rather than listed, extracted or tested.
pub fn enumerate(
    archive:   &mut dyn ArchiveFormat,
    source:    &mut dyn Source,
    mode:      EnumerateMode,
    progress:  &mut ProgressState,
    path:      &Path,
    file_type: FileType,
) -> Result<Vec<ArchiveRecord>, UnpackError> {
    let records = archive
        .enumerate_records(source, mode, progress)
        .map_err(|e| match e {
            FormatError::Cancelled => UnpackError::Cancelled,
            err => UnpackError::Enumeration {
                path: path.to_path_buf(),
                file_type,
                source: err,
            },
        })?;

    debug!(count = records.len(), ?mode, "records enumerated");
    if records.is_empty() {
        return Err(UnpackError::EmptyArchive { path: path.to_path_buf(), file_type });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_crc_is_not_truncated() {
        let wide = ArchiveRecord::new(0, 0).with(PropertyKey::Crc, 0x1_0000_1234u64);
        assert_eq!(wide.crc(), None);
        assert_eq!(wide.crc_display(), "-");

        let fits = ArchiveRecord::new(0, 0).with(PropertyKey::Crc, 0xFFFF_FFFFu64);
        assert_eq!(fits.crc(), Some(u32::MAX));
    }

    #[test]
    fn display_name_falls_back_to_index() {
        let named = ArchiveRecord::new(0, 0).with(PropertyKey::OriginalName, "a.txt");
        let blank = ArchiveRecord::new(0, 0).with(PropertyKey::OriginalName, "");
        assert_eq!(named.display_name(0), "a.txt");
        assert_eq!(blank.display_name(1), "record_1");
        assert_eq!(ArchiveRecord::new(0, 0).display_name(2), "record_2");
    }

    #[test]
    fn compressed_size_falls_back_to_stream_size() {
        let unset = ArchiveRecord::new(0, 42);
        let zero = ArchiveRecord::new(0, 42).with(PropertyKey::CompressedSize, 0u64);
        let set = ArchiveRecord::new(0, 42).with(PropertyKey::CompressedSize, 10u64);
        assert_eq!(unset.compressed_size(), 42);
        assert_eq!(zero.compressed_size(), 42);
        assert_eq!(set.compressed_size(), 10);
    }

    #[test]
    fn crc_renders_as_upper_hex() {
        let r = ArchiveRecord::new(0, 0).with(PropertyKey::Crc, 0x1234u64);
        assert_eq!(r.crc_display(), "1234");
        let r = ArchiveRecord::new(0, 0).with(PropertyKey::Crc, 0xdeadbeefu64);
        assert_eq!(r.crc_display(), "DEADBEEF");
        assert_eq!(ArchiveRecord::new(0, 0).crc_display(), "-");
    }

    #[test]
    fn typed_lookup_rejects_wrong_kind() {
        let r = ArchiveRecord::new(0, 0).with(PropertyKey::Method, "Deflate");
        assert_eq!(r.text(PropertyKey::Method), Some("Deflate"));
        assert_eq!(r.number(PropertyKey::Method), None);
        assert!(!r.is_folder());
    }

    #[test]
    fn properties_serialize_with_snake_case_keys() {
        let r = ArchiveRecord::new(0, 5)
            .with(PropertyKey::OriginalName, "x")
            .with(PropertyKey::IsFolder, false);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["properties"]["original_name"], "x");
        assert_eq!(json["properties"]["is_folder"], false);
        assert_eq!(json["stream_size"], 5);
    }
}
