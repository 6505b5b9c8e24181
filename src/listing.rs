//! Rendering of enumerated records for list mode.

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::format::FileType;
use crate::record::{ArchiveRecord, PropertyKey, PropertyValue};

const RULE_WIDTH: usize = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFormat {
    #[default]
    Text,
    Json,
}

/// One listing line, with the fallbacks already applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingRow<'a> {
    pub index:             usize,
    pub name:              String,
    pub compressed_size:   u64,
    pub uncompressed_size: Option<u64>,
    pub crc:               String,
    pub properties:        &'a BTreeMap<PropertyKey, PropertyValue>,
}

impl<'a> ListingRow<'a> {
    pub fn new(index: usize, record: &'a ArchiveRecord) -> Self {
        Self {
            index,
            name:              record.display_name(index),
            compressed_size:   record.compressed_size(),
            uncompressed_size: record.uncompressed_size(),
            crc:               record.crc_display(),
            properties:        &record.properties,
        }
    }

    pub fn to_line(&self) -> String {
        let uncompressed = self
            .uncompressed_size
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        format!(
            "{:<50} {:>15} {:>15} {:>10}",
            self.name, self.compressed_size, uncompressed, self.crc
        )
    }
}

pub fn rows(records: &[ArchiveRecord]) -> Vec<ListingRow<'_>> {
    records.iter().enumerate().map(|(i, r)| ListingRow::new(i, r)).collect()
}

pub fn render_text<W: Write + ?Sized>(out: &mut W, records: &[ArchiveRecord]) -> io::Result<()> {
    let rule = "-".repeat(RULE_WIDTH);
    writeln!(out, "Archive contents:")?;
    writeln!(
        out,
        "{:<50} {:>15} {:>15} {:>10}",
        "Name", "Compressed", "Uncompressed", "CRC32"
    )?;
    writeln!(out, "{rule}")?;
    for row in rows(records) {
        writeln!(out, "{}", row.to_line())?;
    }
    writeln!(out, "{rule}")?;
    writeln!(out, "Total: {} file(s)", records.len())
}

#[derive(Serialize)]
struct JsonListing<'a> {
    file_type: FileType,
    total:     usize,
    records:   Vec<ListingRow<'a>>,
}

pub fn render_json<W: Write + ?Sized>(
    out:       &mut W,
    file_type: FileType,
    records:   &[ArchiveRecord],
) -> io::Result<()> {
    let listing = JsonListing { file_type, total: records.len(), records: rows(records) };
    serde_json::to_writer_pretty(&mut *out, &listing)?;
    writeln!(out)
}
