//! ZIP reader.
//!
//! Read from the end: locate the end-of-central-directory record (EOCD),
//! follow the ZIP64 locator when any EOCD field is saturated, then walk the
//! central directory.  Entry data is reached through each local header.
//!
//! Self-extracting archives prepend a stub, so every stored offset is
//! relative to a base that is recovered from where the central directory
//! actually ends.
//!
//! Supported methods: STORED (0) and DEFLATE (8).  Encrypted entries are
//! reported as unsupported.

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use flate2::read::DeflateDecoder;
use tracing::{debug, trace};

use super::{
    copy_with_progress, is_root_entry, sanitize_entry_path, stream_len, ArchiveFormat, CountingReader,
    EnumerateMode, FileType, FormatError, Source,
};
use crate::progress::ProgressState;
use crate::record::{ArchiveRecord, PropertyKey};

// ── Record layouts ───────────────────────────────────────────────────────────

const EOCD_SIG:       [u8; 4] = *b"PK\x05\x06";
const EOCD64_LOC_SIG: [u8; 4] = *b"PK\x06\x07";
const EOCD64_SIG:     [u8; 4] = *b"PK\x06\x06";
const CDFH_SIG:       [u8; 4] = *b"PK\x01\x02";
const LFH_SIG:        [u8; 4] = *b"PK\x03\x04";

pub const EOCD_SIZE:   usize = 22;
/// EOCD plus the longest possible archive comment.
pub const EOCD_SEARCH: usize = EOCD_SIZE + u16::MAX as usize;

const EOCD64_LOC_SIZE: usize = 20;
const EOCD64_SIZE:     usize = 56;
const CDFH_SIZE:       usize = 46;
const LFH_SIZE:        usize = 30;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const FLAG_ENCRYPTED: u16 = 0x0001;
const HOST_UNIX:      u16 = 3;

const METHOD_STORED:  u16 = 0;
const METHOD_DEFLATE: u16 = 8;

/// Offset of a valid EOCD within `tail`, which must end at end-of-file.
///
/// Valid means the signature matches and the comment length accounts for
/// exactly the remaining bytes.
pub fn find_eocd(tail: &[u8]) -> Option<usize> {
    if tail.len() < EOCD_SIZE {
        return None;
    }
    (0..=tail.len() - EOCD_SIZE).rev().find(|&i| {
        tail[i..i + 4] == EOCD_SIG
            && LittleEndian::read_u16(&tail[i + 20..]) as usize == tail.len() - i - EOCD_SIZE
    })
}

// ── Directory ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    pub name:              String,
    pub flags:             u16,
    pub method:            u16,
    pub crc32:             u32,
    pub compressed_size:   u64,
    pub uncompressed_size: u64,
    pub lfh_offset:        u64,
    pub modified:          Option<DateTime<Utc>>,
    pub mode:              Option<u32>,
    pub is_dir:            bool,
}

impl ZipEntry {
    pub fn method_name(&self) -> String {
        match self.method {
            METHOD_STORED  => "Store".into(),
            METHOD_DEFLATE => "Deflate".into(),
            other          => format!("Method {other}"),
        }
    }

    fn to_record(&self) -> ArchiveRecord {
        let mut record = ArchiveRecord::new(self.lfh_offset, self.compressed_size)
            .with(PropertyKey::OriginalName, self.name.as_str())
            .with(PropertyKey::CompressedSize, self.compressed_size)
            .with(PropertyKey::UncompressedSize, self.uncompressed_size)
            .with(PropertyKey::Crc, self.crc32 as u64)
            .with(PropertyKey::Method, self.method_name())
            .with(PropertyKey::IsFolder, self.is_dir);
        if let Some(modified) = self.modified {
            record.set(PropertyKey::ModifiedTime, modified);
        }
        if let Some(mode) = self.mode {
            record.set(PropertyKey::Mode, mode as u64);
        }
        record
    }
}

#[derive(Debug, Clone)]
pub struct Directory {
    /// Length of any prefix (self-extractor stub) before the archive proper.
    pub base:    u64,
    pub entries: Vec<ZipEntry>,
}

struct CentralDirLocation {
    offset:  u64,
    size:    u64,
    entries: u64,
    /// Where the central directory really ends in the file.
    end:     u64,
}

pub fn read_directory(source: &mut dyn Source) -> Result<Directory, FormatError> {
    let len = stream_len(source)?;
    if len < EOCD_SIZE as u64 {
        return Err(FormatError::Corrupt("file too short for a zip archive".into()));
    }

    let tail_len = (EOCD_SEARCH as u64).min(len);
    let tail_start = len - tail_len;
    let tail = read_exact_at(source, tail_start, tail_len as usize)?;
    let eocd_at = find_eocd(&tail)
        .ok_or_else(|| FormatError::Corrupt("end of central directory not found".into()))?;
    let eocd_pos = tail_start + eocd_at as u64;

    let location = locate_central_dir(source, &tail[eocd_at..], eocd_pos)?;
    let base = location
        .end
        .checked_sub(location.offset.saturating_add(location.size))
        .ok_or_else(|| FormatError::Corrupt("central directory offset past its end".into()))?;
    if base > 0 {
        debug!(base, "zip data starts after a prefix");
    }

    let cd_start = base + location.offset;
    if cd_start.saturating_add(location.size) > len {
        return Err(FormatError::Corrupt("central directory exceeds file".into()));
    }
    let cd = read_exact_at(source, cd_start, location.size as usize)?;
    let entries = parse_central_dir(&cd, location.entries)?;
    trace!(count = entries.len(), "central directory parsed");

    Ok(Directory { base, entries })
}

fn locate_central_dir(
    source:   &mut dyn Source,
    eocd:     &[u8],
    eocd_pos: u64,
) -> Result<CentralDirLocation, FormatError> {
    let mut r = Cursor::new(&eocd[4..]);
    let _disk          = r.read_u16::<LittleEndian>()?;
    let _disk_with_cd  = r.read_u16::<LittleEndian>()?;
    let disk_entries   = r.read_u16::<LittleEndian>()?;
    let total_entries  = r.read_u16::<LittleEndian>()?;
    let cd_size        = r.read_u32::<LittleEndian>()?;
    let cd_offset      = r.read_u32::<LittleEndian>()?;

    let saturated = disk_entries == u16::MAX
        || total_entries == u16::MAX
        || cd_size == u32::MAX
        || cd_offset == u32::MAX;

    if !saturated || eocd_pos < EOCD64_LOC_SIZE as u64 {
        return Ok(CentralDirLocation {
            offset:  cd_offset as u64,
            size:    cd_size as u64,
            entries: total_entries as u64,
            end:     eocd_pos,
        });
    }

    let locator_pos = eocd_pos - EOCD64_LOC_SIZE as u64;
    let locator = read_exact_at(source, locator_pos, EOCD64_LOC_SIZE)?;
    if locator[..4] != EOCD64_LOC_SIG {
        return Err(FormatError::Corrupt("zip64 locator missing".into()));
    }
    let recorded = LittleEndian::read_u64(&locator[8..]);

    // Recorded offsets ignore any stub; fall back to the record sitting
    // directly before the locator.
    let mut record_pos = recorded;
    let mut record = read_exact_at(source, record_pos, EOCD64_SIZE).ok();
    if record.as_ref().map_or(true, |r| r[..4] != EOCD64_SIG) {
        record_pos = locator_pos
            .checked_sub(EOCD64_SIZE as u64)
            .ok_or_else(|| FormatError::Corrupt("zip64 end of central directory missing".into()))?;
        record = Some(read_exact_at(source, record_pos, EOCD64_SIZE)?);
    }
    let record = record.unwrap_or_default();
    if record.len() < EOCD64_SIZE || record[..4] != EOCD64_SIG {
        return Err(FormatError::Corrupt("zip64 end of central directory missing".into()));
    }

    let mut r = Cursor::new(&record[24..]);
    let _disk_entries = r.read_u64::<LittleEndian>()?;
    let total_entries = r.read_u64::<LittleEndian>()?;
    let cd_size       = r.read_u64::<LittleEndian>()?;
    let cd_offset     = r.read_u64::<LittleEndian>()?;

    Ok(CentralDirLocation {
        offset:  cd_offset,
        size:    cd_size,
        entries: total_entries,
        end:     record_pos,
    })
}

fn parse_central_dir(cd: &[u8], expected: u64) -> Result<Vec<ZipEntry>, FormatError> {
    let mut entries = Vec::with_capacity(expected.min(1 << 16) as usize);
    let mut pos = 0usize;
    while entries.len() as u64 != expected {
        if cd.len() < pos + CDFH_SIZE || cd[pos..pos + 4] != CDFH_SIG {
            return Err(FormatError::Corrupt(format!(
                "central directory holds {} of {expected} entries",
                entries.len()
            )));
        }
        let (entry, used) = parse_cdfh(&cd[pos..])?;
        entries.push(entry);
        pos += used;
    }
    Ok(entries)
}

fn parse_cdfh(data: &[u8]) -> Result<(ZipEntry, usize), FormatError> {
    let mut r = Cursor::new(&data[4..CDFH_SIZE]);
    let made_by       = r.read_u16::<LittleEndian>()?;
    let _needed       = r.read_u16::<LittleEndian>()?;
    let flags         = r.read_u16::<LittleEndian>()?;
    let method        = r.read_u16::<LittleEndian>()?;
    let dos_time      = r.read_u16::<LittleEndian>()?;
    let dos_date      = r.read_u16::<LittleEndian>()?;
    let crc32         = r.read_u32::<LittleEndian>()?;
    let csize         = r.read_u32::<LittleEndian>()?;
    let usize_        = r.read_u32::<LittleEndian>()?;
    let name_len      = r.read_u16::<LittleEndian>()? as usize;
    let extra_len     = r.read_u16::<LittleEndian>()? as usize;
    let comment_len   = r.read_u16::<LittleEndian>()? as usize;
    let _disk_start   = r.read_u16::<LittleEndian>()?;
    let _internal     = r.read_u16::<LittleEndian>()?;
    let external      = r.read_u32::<LittleEndian>()?;
    let lfh_offset    = r.read_u32::<LittleEndian>()?;

    let used = CDFH_SIZE + name_len + extra_len + comment_len;
    if data.len() < used {
        return Err(FormatError::Corrupt("truncated central directory entry".into()));
    }
    let name = String::from_utf8_lossy(&data[CDFH_SIZE..CDFH_SIZE + name_len]).into_owned();
    let extra = &data[CDFH_SIZE + name_len..CDFH_SIZE + name_len + extra_len];

    let mut compressed_size = csize as u64;
    let mut uncompressed_size = usize_ as u64;
    let mut lfh = lfh_offset as u64;
    apply_zip64_extra(extra, &mut uncompressed_size, &mut compressed_size, &mut lfh)?;

    let unix_mode = (made_by >> 8 == HOST_UNIX).then_some((external >> 16) & 0o7777);
    let is_dir = name.ends_with('/') || name.ends_with('\\') || external & 0x10 != 0;

    Ok((
        ZipEntry {
            name,
            flags,
            method,
            crc32,
            compressed_size,
            uncompressed_size,
            lfh_offset: lfh,
            modified: dos_datetime(dos_date, dos_time),
            mode: unix_mode.filter(|m| *m != 0),
            is_dir,
        },
        used,
    ))
}

/// Replace saturated 32-bit fields from the ZIP64 extended-information field.
fn apply_zip64_extra(
    mut extra:    &[u8],
    uncompressed: &mut u64,
    compressed:   &mut u64,
    lfh_offset:   &mut u64,
) -> Result<(), FormatError> {
    while extra.len() >= 4 {
        let id = LittleEndian::read_u16(extra);
        let size = LittleEndian::read_u16(&extra[2..]) as usize;
        if extra.len() < 4 + size {
            break;
        }
        if id == ZIP64_EXTRA_ID {
            let mut r = &extra[4..4 + size];
            for field in [uncompressed, compressed, lfh_offset] {
                if *field == u32::MAX as u64 {
                    *field = r.read_u64::<LittleEndian>().map_err(|_| {
                        FormatError::Corrupt("zip64 extra field too short".into())
                    })?;
                }
            }
            return Ok(());
        }
        extra = &extra[4 + size..];
    }
    Ok(())
}

/// MS-DOS date and time, interpreted as UTC.
pub fn dos_datetime(date: u16, time: u16) -> Option<DateTime<Utc>> {
    let day    = (date & 0x1F) as u32;
    let month  = ((date >> 5) & 0x0F) as u32;
    let year   = ((date >> 9) & 0x7F) as i32 + 1980;
    let second = ((time & 0x1F) * 2) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let hour   = ((time >> 11) & 0x1F) as u32;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}

fn read_exact_at(source: &mut dyn Source, offset: u64, n: usize) -> Result<Vec<u8>, FormatError> {
    source.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; n];
    source.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FormatError::Corrupt("unexpected end of file".into()),
        _ => FormatError::Io(e),
    })?;
    Ok(buf)
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Hashes everything written through it.
struct CrcWriter<W> {
    inner:  W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn extract_entry(
    source:   &mut dyn Source,
    base:     u64,
    entry:    &ZipEntry,
    target:   &Path,
    progress: &mut ProgressState,
) -> Result<(), FormatError> {
    if entry.flags & FLAG_ENCRYPTED != 0 {
        return Err(FormatError::Unsupported(format!("encrypted entry {}", entry.name)));
    }

    let lfh_pos = base + entry.lfh_offset;
    let lfh = read_exact_at(source, lfh_pos, LFH_SIZE)?;
    if lfh[..4] != LFH_SIG {
        return Err(FormatError::Corrupt(format!("bad local header for {}", entry.name)));
    }
    let name_len = LittleEndian::read_u16(&lfh[26..]) as u64;
    let extra_len = LittleEndian::read_u16(&lfh[28..]) as u64;
    source.seek(SeekFrom::Start(lfh_pos + LFH_SIZE as u64 + name_len + extra_len))?;

    let (raw, consumed) = CountingReader::new((&mut *source).take(entry.compressed_size));
    let mut reader: Box<dyn Read + '_> = match entry.method {
        METHOD_STORED  => Box::new(raw),
        METHOD_DEFLATE => Box::new(DeflateDecoder::new(raw)),
        other => {
            return Err(FormatError::Unsupported(format!(
                "compression method {other} in {}",
                entry.name
            )))
        }
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let slot = progress.claim(entry.compressed_size, entry.name.as_str())?;
    let mut out = CrcWriter { inner: File::create(target)?, hasher: crc32fast::Hasher::new() };
    let written = copy_with_progress(&mut reader, &mut out, progress, slot, Some(&consumed))?;
    out.flush()?;
    progress.end_slot(slot)?;

    if written != entry.uncompressed_size {
        return Err(FormatError::Corrupt(format!(
            "{}: expected {} bytes, got {written}",
            entry.name, entry.uncompressed_size
        )));
    }
    let actual = out.hasher.finalize();
    if actual != entry.crc32 {
        return Err(FormatError::CrcMismatch {
            name:     entry.name.clone(),
            expected: entry.crc32,
            actual,
        });
    }
    Ok(())
}

// ── Format ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ZipFormat;

impl ZipFormat {
    pub fn new() -> Self {
        Self
    }
}

impl ArchiveFormat for ZipFormat {
    fn file_type(&self) -> FileType {
        FileType::Zip
    }

    fn enumerate_records(
        &mut self,
        source:   &mut dyn Source,
        _mode:    EnumerateMode,
        progress: &mut ProgressState,
    ) -> Result<Vec<ArchiveRecord>, FormatError> {
        let directory = read_directory(source)?;
        let slot = progress.claim(directory.entries.len() as u64, "")?;
        let mut records = Vec::with_capacity(directory.entries.len());
        for (i, entry) in directory.entries.iter().enumerate() {
            progress.checkpoint()?;
            records.push(entry.to_record());
            progress.advance(slot, i as u64 + 1)?;
        }
        progress.end_slot(slot)?;
        Ok(records)
    }

    fn unpack_to_folder(
        &mut self,
        source:      &mut dyn Source,
        destination: &Path,
        progress:    &mut ProgressState,
    ) -> Result<(), FormatError> {
        let directory = read_directory(source)?;
        fs::create_dir_all(destination)?;

        let total: u64 = directory.entries.iter().map(|e| e.compressed_size).sum();
        let overall = progress.claim(total, "")?;
        let mut done = 0u64;

        for entry in &directory.entries {
            progress.checkpoint()?;
            if entry.is_dir && is_root_entry(&entry.name) {
                continue;
            }
            let target = sanitize_entry_path(destination, &entry.name)?;
            if entry.is_dir {
                fs::create_dir_all(&target)?;
            } else {
                extract_entry(source, directory.base, entry, &target, progress)?;
                trace!(name = %entry.name, size = entry.uncompressed_size, "entry extracted");
            }
            done += entry.compressed_size;
            progress.advance(overall, done)?;
        }
        progress.end_slot(overall)?;
        Ok(())
    }
}
