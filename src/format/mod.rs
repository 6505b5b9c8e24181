//! Container formats: classification, handler lookup and the bundled readers.
//!
//! The orchestrator talks to formats only through [`Registry`],
//! [`Handler`] and [`ArchiveFormat`].  [`Formats`] is the registry shipped
//! with the binary; tests substitute their own.
//!
//! # Priority
//! When a source matches several types, the lowest [`FileType::priority`]
//! wins: compressed tarballs, plain tar, zip, bare compressed streams, then
//! recognised non-archive types.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::progress::{Cancelled, ProgressError, ProgressState};
use crate::record::ArchiveRecord;

pub mod detect;
pub mod stream;
pub mod tar;
pub mod zip;

/// Chunk size for streamed copies; cancellation is polled once per chunk.
pub const COPY_CHUNK: usize = 64 * 1024;

// ── Source ───────────────────────────────────────────────────────────────────

/// A seekable byte source (usually the opened input file).
pub trait Source: Read + Seek {}
impl<T: Read + Seek + ?Sized> Source for T {}

/// Total length of `source`; leaves the cursor at offset 0.
pub fn stream_len(source: &mut dyn Source) -> io::Result<u64> {
    let len = source.seek(SeekFrom::End(0))?;
    source.rewind()?;
    Ok(len)
}

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Codec {
    Gzip,
    Zstd,
    Xz,
    Lz4,
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Codec::Gzip => "GZ",
            Codec::Zstd => "ZST",
            Codec::Xz   => "XZ",
            Codec::Lz4  => "LZ4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileType {
    Zip,
    Tar,
    CompressedTar(Codec),
    Compressed(Codec),
    Elf,
    Pe,
    Png,
    Pdf,
}

impl FileType {
    pub fn name(self) -> String {
        match self {
            FileType::Zip                  => "ZIP".into(),
            FileType::Tar                  => "TAR".into(),
            FileType::CompressedTar(codec) => format!("TAR.{}", codec.name()),
            FileType::Compressed(Codec::Gzip) => "GZIP".into(),
            FileType::Compressed(Codec::Zstd) => "ZSTD".into(),
            FileType::Compressed(codec)    => codec.name().into(),
            FileType::Elf                  => "ELF".into(),
            FileType::Pe                   => "PE".into(),
            FileType::Png                  => "PNG".into(),
            FileType::Pdf                  => "PDF".into(),
        }
    }

    pub fn is_archive(self) -> bool {
        matches!(
            self,
            FileType::Zip | FileType::Tar | FileType::CompressedTar(_) | FileType::Compressed(_)
        )
    }

    /// Lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            FileType::CompressedTar(_) => 0,
            FileType::Tar              => 1,
            FileType::Zip              => 2,
            FileType::Compressed(_)    => 3,
            FileType::Elf              => 4,
            FileType::Pe               => 5,
            FileType::Png              => 6,
            FileType::Pdf              => 7,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for FileType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// Every type the classifier judged plausible, in a stable order.
pub type CandidateSet = BTreeSet<FileType>;

/// How much work an enumeration should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerateMode {
    /// Every property a listing shows, even if that means decoding a whole stream.
    Full,
    /// Enough to count records and name them.
    CountOnly,
}

/// What the caller knows about the source beyond its bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceHint {
    pub stem: Option<String>,
    pub len:  u64,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unsafe entry path: {0}")]
    UnsafePath(String),
    #[error("CRC mismatch in {name}: expected {expected:08X}, got {actual:08X}")]
    CrcMismatch { name: String, expected: u32, actual: u32 },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Progress(#[from] ProgressError),
}

impl From<Cancelled> for FormatError {
    fn from(_: Cancelled) -> Self {
        FormatError::Cancelled
    }
}

// ── Collaborator contracts ───────────────────────────────────────────────────

/// A container that can enumerate and materialise its records.
pub trait ArchiveFormat {
    fn file_type(&self) -> FileType;

    fn enumerate_records(
        &mut self,
        source:   &mut dyn Source,
        mode:     EnumerateMode,
        progress: &mut ProgressState,
    ) -> Result<Vec<ArchiveRecord>, FormatError>;

    fn unpack_to_folder(
        &mut self,
        source:      &mut dyn Source,
        destination: &Path,
        progress:    &mut ProgressState,
    ) -> Result<(), FormatError>;
}

/// What [`Registry::get_handler`] hands back for a resolved type.
pub enum Handler {
    Archive(Box<dyn ArchiveFormat>),
    /// A recognised format with no archive capability.
    Binary(FileType),
}

impl Handler {
    pub fn as_archive(&mut self) -> Option<&mut dyn ArchiveFormat> {
        match self {
            Handler::Archive(archive) => Some(&mut **archive),
            Handler::Binary(_)        => None,
        }
    }

    pub fn file_type(&self) -> FileType {
        match self {
            Handler::Archive(archive) => archive.file_type(),
            Handler::Binary(ft)       => *ft,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Archive(a) => f.debug_tuple("Archive").field(&a.file_type()).finish(),
            Handler::Binary(ft) => f.debug_tuple("Binary").field(ft).finish(),
        }
    }
}

pub trait Registry {
    /// Every plausible type for `source`.  The source is rewound afterwards.
    fn classify(&self, source: &mut dyn Source) -> io::Result<CandidateSet>;

    /// Pick one candidate.  `None` only for an empty set.
    fn preferred(&self, candidates: &CandidateSet) -> Option<FileType>;

    fn get_handler(
        &self,
        file_type: FileType,
        source:    &mut dyn Source,
        hint:      &SourceHint,
    ) -> Option<Handler>;
}

/// The bundled registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Formats;

impl Registry for Formats {
    fn classify(&self, source: &mut dyn Source) -> io::Result<CandidateSet> {
        detect::classify(source)
    }

    fn preferred(&self, candidates: &CandidateSet) -> Option<FileType> {
        candidates.iter().copied().min_by_key(|ft| ft.priority())
    }

    fn get_handler(
        &self,
        file_type: FileType,
        _source:   &mut dyn Source,
        hint:      &SourceHint,
    ) -> Option<Handler> {
        let handler = match file_type {
            FileType::Zip                  => Handler::Archive(Box::new(zip::ZipFormat::new())),
            FileType::Tar                  => Handler::Archive(Box::new(tar::TarFormat::new(None))),
            FileType::CompressedTar(codec) => Handler::Archive(Box::new(tar::TarFormat::new(Some(codec)))),
            FileType::Compressed(codec)    => Handler::Archive(Box::new(stream::StreamFormat::new(codec, hint))),
            other                          => Handler::Binary(other),
        };
        Some(handler)
    }
}

// ── Extraction helpers ───────────────────────────────────────────────────────

/// Resolve an entry name below `destination`.
///
/// Absolute names, drive prefixes and any `..` component are rejected.
/// Backslashes are treated as separators.
pub fn sanitize_entry_path(destination: &Path, name: &str) -> Result<PathBuf, FormatError> {
    let normalized = name.replace('\\', "/");
    let mut relative = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir       => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FormatError::UnsafePath(name.to_string()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(FormatError::UnsafePath(name.to_string()));
    }
    Ok(destination.join(relative))
}

/// True for names that denote the extraction root itself (`./`, `.`).
pub fn is_root_entry(name: &str) -> bool {
    let normalized = name.replace('\\', "/");
    Path::new(&normalized)
        .components()
        .all(|c| c == Component::CurDir)
}

/// Check that a link entry named `entry`, pointing at `target`, resolves
/// inside the extraction root.
///
/// Symbolic link targets are relative to the link's own directory; hard
/// link targets are relative to the root.  `..` is fine as long as it never
/// climbs above the root.
pub fn check_link_target(entry: &str, target: &str, symbolic: bool) -> Result<(), FormatError> {
    let unsafe_target = || FormatError::UnsafePath(format!("{entry} -> {target}"));

    let mut depth = if symbolic {
        let entry = entry.replace('\\', "/");
        Path::new(&entry)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
            .saturating_sub(1)
    } else {
        0
    };

    let normalized = target.replace('\\', "/");
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir    => {}
            Component::ParentDir => depth = depth.checked_sub(1).ok_or_else(unsafe_target)?,
            Component::RootDir | Component::Prefix(_) => return Err(unsafe_target()),
        }
    }
    Ok(())
}

/// Shared count of bytes pulled through a [`CountingReader`].
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Rc<Cell<u64>>);

impl ByteCounter {
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

/// Counts raw bytes consumed so progress can follow the compressed input
/// while a decoder sits on top.
pub struct CountingReader<R> {
    inner:   R,
    counter: ByteCounter,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> (Self, ByteCounter) {
        let counter = ByteCounter::default();
        (Self { inner, counter: counter.clone() }, counter)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.0.set(self.counter.0.get() + n as u64);
        Ok(n)
    }
}

/// Copy `reader` into `writer` chunk by chunk, polling cancellation and
/// advancing `slot` to either the bytes written or, when given, `counter`.
pub fn copy_with_progress(
    reader:   &mut dyn Read,
    writer:   &mut dyn Write,
    progress: &mut ProgressState,
    slot:     usize,
    counter:  Option<&ByteCounter>,
) -> Result<u64, FormatError> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut written = 0u64;
    loop {
        progress.checkpoint()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        written += n as u64;
        progress.advance(slot, counter.map_or(written, ByteCounter::get))?;
    }
    Ok(written)
}
