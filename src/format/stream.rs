//! Single compressed streams (gzip, zstd, xz, lz4) and the decoders shared
//! with compressed tarballs.
//!
//! A bare stream is an archive of exactly one record.  Its name comes from
//! the gzip header when present, else from the input file's stem.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use tracing::debug;
use xz2::read::XzDecoder;

use super::{
    copy_with_progress, sanitize_entry_path, stream_len, ArchiveFormat, Codec, CountingReader,
    EnumerateMode, FileType, FormatError, Source, SourceHint, COPY_CHUNK,
};
use crate::progress::ProgressState;
use crate::record::{placeholder_name, ArchiveRecord, PropertyKey};

// gzip header flags (RFC 1952)
const FHCRC:    u8 = 0x02;
const FEXTRA:   u8 = 0x04;
const FNAME:    u8 = 0x08;
const FCOMMENT: u8 = 0x10;

// ── Decoders ─────────────────────────────────────────────────────────────────

/// Wrap `reader` in the streaming decoder for `codec`.  Every decoder pulls
/// its input in bounded chunks, so memory stays flat and raw-byte progress
/// follows the decode.
pub fn decoder<'a, R: Read + 'a>(codec: Codec, reader: R) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match codec {
        Codec::Gzip => Box::new(MultiGzDecoder::new(reader)),
        Codec::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        Codec::Lz4  => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        Codec::Xz   => Box::new(XzDecoder::new_multi_decoder(reader)),
    })
}

/// Decode at most `limit` bytes from the start of the stream.
pub fn peek_head<R: Read>(codec: Codec, reader: R, limit: usize) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(limit);
    decoder(codec, reader)?.take(limit as u64).read_to_end(&mut head)?;
    Ok(head)
}

// ── gzip header ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GzipHeader {
    pub name:  Option<String>,
    pub mtime: Option<DateTime<Utc>>,
}

/// Parse the member header at the start of a gzip stream.
pub fn read_gzip_header<R: Read>(mut r: R) -> Result<GzipHeader, FormatError> {
    let mut fixed = [0u8; 3];
    r.read_exact(&mut fixed)?;
    if fixed[..2] != [0x1F, 0x8B] {
        return Err(FormatError::Corrupt("gzip magic missing".into()));
    }
    if fixed[2] != 8 {
        return Err(FormatError::Unsupported(format!("gzip method {}", fixed[2])));
    }
    let flags = r.read_u8()?;
    let mtime = r.read_u32::<LittleEndian>()?;
    let _xfl = r.read_u8()?;
    let _os = r.read_u8()?;

    if flags & FEXTRA != 0 {
        let xlen = r.read_u16::<LittleEndian>()?;
        io::copy(&mut (&mut r).take(xlen as u64), &mut io::sink())?;
    }
    let name = if flags & FNAME != 0 { Some(read_latin1_z(&mut r)?) } else { None };
    if flags & FCOMMENT != 0 {
        read_latin1_z(&mut r)?;
    }
    if flags & FHCRC != 0 {
        r.read_u16::<LittleEndian>()?;
    }

    Ok(GzipHeader {
        name:  name.filter(|n| !n.is_empty()),
        mtime: (mtime != 0)
            .then(|| DateTime::from_timestamp(mtime as i64, 0))
            .flatten(),
    })
}

/// Zero-terminated ISO 8859-1 string.
fn read_latin1_z<R: Read>(r: &mut R) -> io::Result<String> {
    let mut out = String::new();
    loop {
        match r.read_u8()? {
            0 => return Ok(out),
            b => out.push(b as char),
        }
    }
}

// ── Format ───────────────────────────────────────────────────────────────────

/// A bare compressed stream, exposed as a one-record archive.
#[derive(Debug, Clone)]
pub struct StreamFormat {
    codec: Codec,
    stem:  Option<String>,
}

impl StreamFormat {
    pub fn new(codec: Codec, hint: &SourceHint) -> Self {
        Self { codec, stem: hint.stem.clone() }
    }

    /// Name for the single record: embedded gzip name (file part only),
    /// else the input stem.
    fn record_name(&self, header: &GzipHeader) -> Option<String> {
        header
            .name
            .as_deref()
            .map(|n| n.rsplit(['/', '\\']).next().unwrap_or(n).to_string())
            .filter(|n| !n.is_empty() && n != "." && n != "..")
            .or_else(|| self.stem.clone().filter(|s| !s.is_empty()))
    }

    fn header(&self, source: &mut dyn Source) -> Result<GzipHeader, FormatError> {
        if self.codec != Codec::Gzip {
            return Ok(GzipHeader::default());
        }
        source.rewind()?;
        let header = read_gzip_header(&mut *source)?;
        source.rewind()?;
        Ok(header)
    }
}

impl ArchiveFormat for StreamFormat {
    fn file_type(&self) -> FileType {
        FileType::Compressed(self.codec)
    }

    fn enumerate_records(
        &mut self,
        source:   &mut dyn Source,
        mode:     EnumerateMode,
        progress: &mut ProgressState,
    ) -> Result<Vec<ArchiveRecord>, FormatError> {
        let len = stream_len(source)?;
        let header = self.header(source)?;

        let mut record = ArchiveRecord::new(0, len)
            .with(PropertyKey::CompressedSize, len)
            .with(PropertyKey::IsFolder, false)
            .with(PropertyKey::Method, self.codec.name());
        if let Some(name) = self.record_name(&header) {
            record.set(PropertyKey::OriginalName, name);
        }
        if let Some(mtime) = header.mtime {
            record.set(PropertyKey::ModifiedTime, mtime);
        }

        if mode == EnumerateMode::Full {
            let slot = progress.claim(len, "decoding")?;
            let (counting, consumed) = CountingReader::new(&mut *source);
            let mut reader = decoder(self.codec, counting)?;
            let mut hasher = crc32fast::Hasher::new();
            let mut size = 0u64;
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                progress.checkpoint()?;
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                size += n as u64;
                progress.advance(slot, consumed.get())?;
            }
            progress.end_slot(slot)?;
            record.set(PropertyKey::UncompressedSize, size);
            record.set(PropertyKey::Crc, hasher.finalize() as u64);
        }

        debug!(codec = self.codec.name(), name = record.display_name(0), "stream enumerated");
        Ok(vec![record])
    }

    fn unpack_to_folder(
        &mut self,
        source:      &mut dyn Source,
        destination: &Path,
        progress:    &mut ProgressState,
    ) -> Result<(), FormatError> {
        let len = stream_len(source)?;
        let header = self.header(source)?;
        let name = self.record_name(&header).unwrap_or_else(|| placeholder_name(0));
        let target = sanitize_entry_path(destination, &name)?;

        fs::create_dir_all(destination)?;
        let slot = progress.claim(len, name.as_str())?;
        let (counting, consumed) = CountingReader::new(&mut *source);
        let mut reader = decoder(self.codec, counting)?;
        let mut out = File::create(&target)?;
        copy_with_progress(&mut reader, &mut out, progress, slot, Some(&consumed))?;
        out.flush()?;
        progress.end_slot(slot)?;

        debug!(path = %target.display(), "stream unpacked");
        Ok(())
    }
}
