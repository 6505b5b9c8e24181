//! Signature-based classification.
//!
//! Checks, in order:
//!   - magic bytes at offset 0 (zip, compressed streams, ELF, PNG, PDF, `MZ`)
//!   - the `ustar` magic at offset 257
//!   - `PE\0\0` at the offset stored in an `MZ` header's `e_lfanew`
//!   - the decoded head of a compressed stream, for a tar header inside it
//!   - the file tail, for a zip end-of-central-directory record (self-extractors)
//!
//! Every signature check that matches adds a candidate; preference is decided later.

use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::{stream, stream_len, zip, Codec, CandidateSet, FileType, Source};

/// Bytes read from the start of the source.
pub const HEAD_LEN: usize = 1024;
/// A tar header block.
pub const TAR_BLOCK: usize = 512;

const TAR_MAGIC_OFFSET: usize = 257;
const PE_OFFSET_FIELD:  usize = 0x3C;

pub fn classify(source: &mut dyn Source) -> io::Result<CandidateSet> {
    let len = stream_len(source)?;
    let head = read_at(source, 0, HEAD_LEN)?;
    let mut candidates = classify_head(&head);

    if let Some(codec) = stream_codec(&head) {
        source.rewind()?;
        let inner = stream::peek_head(codec, &mut *source, TAR_BLOCK).unwrap_or_else(|e| {
            debug!(codec = codec.name(), error = %e, "compressed head not decodable");
            Vec::new()
        });
        candidates.insert(if is_tar_header(&inner) {
            FileType::CompressedTar(codec)
        } else {
            FileType::Compressed(codec)
        });
    }

    if head.starts_with(b"MZ") && is_pe(source, &head, len)? {
        candidates.insert(FileType::Pe);
    }

    if !candidates.contains(&FileType::Zip) && len >= zip::EOCD_SIZE as u64 {
        let tail_len = (zip::EOCD_SEARCH as u64).min(len);
        let tail = read_at(source, len - tail_len, tail_len as usize)?;
        if zip::find_eocd(&tail).is_some() {
            trace!("end-of-central-directory found in tail");
            candidates.insert(FileType::Zip);
        }
    }

    source.rewind()?;
    debug!(len, ?candidates, "classified");
    Ok(candidates)
}

/// Candidates decidable from the head bytes alone.
pub fn classify_head(head: &[u8]) -> CandidateSet {
    let mut candidates = CandidateSet::new();
    match head {
        [b'P', b'K', 0x03, 0x04, ..] | [b'P', b'K', 0x05, 0x06, ..] => {
            candidates.insert(FileType::Zip);
        }
        [0x7F, b'E', b'L', b'F', ..] => {
            candidates.insert(FileType::Elf);
        }
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => {
            candidates.insert(FileType::Png);
        }
        [b'%', b'P', b'D', b'F', b'-', ..] => {
            candidates.insert(FileType::Pdf);
        }
        _ => {}
    }
    if is_tar_header(head) {
        candidates.insert(FileType::Tar);
    }
    candidates
}

pub fn stream_codec(head: &[u8]) -> Option<Codec> {
    match head {
        [0x1F, 0x8B, ..]                         => Some(Codec::Gzip),
        [0x28, 0xB5, 0x2F, 0xFD, ..]             => Some(Codec::Zstd),
        [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, ..] => Some(Codec::Xz),
        [0x04, 0x22, 0x4D, 0x18, ..]             => Some(Codec::Lz4),
        _                                        => None,
    }
}

/// POSIX (`ustar\0`) and GNU (`ustar  \0`) headers both start with `ustar`.
pub fn is_tar_header(block: &[u8]) -> bool {
    block.len() >= TAR_BLOCK && &block[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
}

fn is_pe(source: &mut dyn Source, head: &[u8], len: u64) -> io::Result<bool> {
    if head.len() < PE_OFFSET_FIELD + 4 {
        return Ok(false);
    }
    let e_lfanew = LittleEndian::read_u32(&head[PE_OFFSET_FIELD..]) as u64;
    if e_lfanew + 4 > len {
        return Ok(false);
    }
    let sig = read_at(source, e_lfanew, 4)?;
    Ok(sig == b"PE\0\0")
}

/// Up to `n` bytes starting at `offset`; shorter at end of stream.
fn read_at(source: &mut dyn Source, offset: u64, n: usize) -> io::Result<Vec<u8>> {
    source.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(n);
    (&mut *source).take(n as u64).read_to_end(&mut buf)?;
    Ok(buf)
}
