//! Tar archives, plain or behind one of the stream codecs.
//!
//! Progress follows the raw (possibly compressed) bytes consumed, which is
//! the only size known up front.

use std::borrow::Cow;
use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::DateTime;
use tracing::{debug, trace};

use super::{
    check_link_target, is_root_entry, sanitize_entry_path, stream, stream_len, ArchiveFormat,
    ByteCounter, Codec, CountingReader, EnumerateMode, FileType, FormatError, Source,
};
use crate::progress::ProgressState;
use crate::record::{ArchiveRecord, PropertyKey};

#[derive(Debug, Clone, Copy)]
pub struct TarFormat {
    codec: Option<Codec>,
}

impl TarFormat {
    pub fn new(codec: Option<Codec>) -> Self {
        Self { codec }
    }

    fn open<'a>(
        &self,
        source: &'a mut dyn Source,
    ) -> Result<(tar::Archive<Box<dyn Read + 'a>>, ByteCounter), FormatError> {
        source.rewind()?;
        let (counting, consumed) = CountingReader::new(source);
        let reader: Box<dyn Read + 'a> = match self.codec {
            Some(codec) => stream::decoder(codec, counting)?,
            None        => Box::new(counting),
        };
        Ok((tar::Archive::new(reader), consumed))
    }
}

fn entry_name(path: Cow<'_, Path>) -> String {
    path.to_string_lossy().into_owned()
}

impl ArchiveFormat for TarFormat {
    fn file_type(&self) -> FileType {
        match self.codec {
            Some(codec) => FileType::CompressedTar(codec),
            None        => FileType::Tar,
        }
    }

    fn enumerate_records(
        &mut self,
        source:   &mut dyn Source,
        _mode:    EnumerateMode,
        progress: &mut ProgressState,
    ) -> Result<Vec<ArchiveRecord>, FormatError> {
        let len = stream_len(source)?;
        let (mut archive, consumed) = self.open(source)?;
        let slot = progress.claim(len, "")?;
        let mut records = Vec::new();

        for entry in archive.entries()? {
            progress.checkpoint()?;
            let entry = entry?;
            let header = entry.header();
            let size = entry.size();

            let mut record = ArchiveRecord::new(entry.raw_file_position(), size)
                .with(PropertyKey::OriginalName, entry_name(entry.path()?))
                .with(PropertyKey::UncompressedSize, size)
                .with(PropertyKey::IsFolder, header.entry_type().is_dir());
            if self.codec.is_none() {
                record.set(PropertyKey::CompressedSize, size);
            }
            if let Some(mtime) = header.mtime().ok().and_then(|t| DateTime::from_timestamp(t as i64, 0)) {
                record.set(PropertyKey::ModifiedTime, mtime);
            }
            if let Ok(mode) = header.mode() {
                record.set(PropertyKey::Mode, mode as u64);
            }
            records.push(record);
            progress.advance(slot, consumed.get())?;
        }

        progress.end_slot(slot)?;
        debug!(count = records.len(), file_type = %self.file_type(), "tar enumerated");
        Ok(records)
    }

    fn unpack_to_folder(
        &mut self,
        source:      &mut dyn Source,
        destination: &Path,
        progress:    &mut ProgressState,
    ) -> Result<(), FormatError> {
        let len = stream_len(source)?;
        let (mut archive, consumed) = self.open(source)?;
        archive.set_overwrite(true);
        archive.set_preserve_permissions(false);
        archive.set_preserve_mtime(true);
        fs::create_dir_all(destination)?;

        let slot = progress.claim(len, "")?;
        for entry in archive.entries()? {
            progress.checkpoint()?;
            let mut entry = entry?;
            let name = entry_name(entry.path()?);
            let kind = entry.header().entry_type();
            if kind.is_dir() && is_root_entry(&name) {
                progress.advance(slot, consumed.get())?;
                continue;
            }
            sanitize_entry_path(destination, &name)?;

            if kind.is_symlink() || kind.is_hard_link() {
                if let Some(target) = entry.link_name()? {
                    check_link_target(&name, &entry_name(target), kind.is_symlink())?;
                }
            }

            if !entry.unpack_in(destination)? {
                return Err(FormatError::UnsafePath(name));
            }
            trace!(name = %name, "entry extracted");
            progress.advance_slot(slot, consumed.get(), name)?;
        }
        progress.end_slot(slot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_600_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn lists_entries_in_order() {
        let data = build_tar(&[("a.txt", &b"alpha"[..]), ("dir/b.txt", &b"bravo!"[..])]);
        let mut format = TarFormat::new(None);
        let records = format
            .enumerate_records(&mut Cursor::new(data), EnumerateMode::Full, &mut ProgressState::default())
            .unwrap();

        let names: Vec<String> = records.iter().enumerate().map(|(i, r)| r.display_name(i)).collect();
        assert_eq!(names, ["a.txt", "dir/b.txt"]);
        assert_eq!(records[1].uncompressed_size(), Some(6));
        assert_eq!(records[1].compressed_size(), 6);
        assert_eq!(records[0].number(PropertyKey::Mode), Some(0o644));
    }

    #[test]
    fn extracts_lz4_wrapped_tar() {
        let data = build_tar(&[("nested/deep/c.bin", &[7u8; 3000][..])]);
        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
        enc.write_all(&data).unwrap();
        let packed = enc.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        TarFormat::new(Some(Codec::Lz4))
            .unpack_to_folder(&mut Cursor::new(packed), dir.path(), &mut ProgressState::default())
            .unwrap();
        assert_eq!(fs::read(dir.path().join("nested/deep/c.bin")).unwrap(), vec![7u8; 3000]);
    }

    /// A header whose name and link fields are written verbatim.
    fn raw_header(kind: tar::EntryType, name: &[u8], link: &[u8], size: u64) -> tar::Header {
        let mut header = tar::Header::new_old();
        header.set_entry_type(kind);
        header.set_size(size);
        header.set_mode(0o755);
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.as_old_mut().linkname[..link.len()].copy_from_slice(link);
        header.set_cksum();
        header
    }

    fn raw_tar(entries: &[(tar::Header, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (header, data) in entries {
            builder.append(header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_dot_rooted_tarball() {
        let data = raw_tar(&[
            (raw_header(tar::EntryType::Directory, b"./", b"", 0), &b""[..]),
            (raw_header(tar::EntryType::Regular, b"./a.txt", b"", 5), &b"alpha"[..]),
            (raw_header(tar::EntryType::Directory, b"./sub/", b"", 0), &b""[..]),
            (raw_header(tar::EntryType::Regular, b"./sub/b.txt", b"", 5), &b"bravo"[..]),
        ]);

        let dir = tempfile::tempdir().unwrap();
        TarFormat::new(None)
            .unpack_to_folder(&mut Cursor::new(data), dir.path(), &mut ProgressState::default())
            .unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dir.path().join("sub/b.txt")).unwrap(), b"bravo");
    }

    #[cfg(unix)]
    #[test]
    fn keeps_symlink_that_climbs_within_root() {
        let data = raw_tar(&[
            (raw_header(tar::EntryType::Regular, b"a.txt", b"", 5), &b"alpha"[..]),
            (raw_header(tar::EntryType::Symlink, b"dir/link", b"../a.txt", 0), &b""[..]),
        ]);

        let dir = tempfile::tempdir().unwrap();
        TarFormat::new(None)
            .unpack_to_folder(&mut Cursor::new(data), dir.path(), &mut ProgressState::default())
            .unwrap();
        let link = dir.path().join("dir/link");
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("../a.txt"));
        assert_eq!(fs::read(&link).unwrap(), b"alpha");
    }

    #[test]
    fn rejects_symlink_escaping_root() {
        let data = raw_tar(&[
            (raw_header(tar::EntryType::Symlink, b"dir/link", b"../../outside", 0), &b""[..]),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let err = TarFormat::new(None)
            .unpack_to_folder(&mut Cursor::new(data), &dir.path().join("out"), &mut ProgressState::default())
            .unwrap_err();
        assert!(matches!(err, FormatError::UnsafePath(_)), "{err}");
        assert!(!dir.path().join("out/dir/link").exists());
    }

    #[test]
    fn rejects_parent_traversal() {
        let mut header = tar::Header::new_old();
        header.set_size(4);
        // `set_path` refuses `..`, so write the name field directly.
        header.as_old_mut().name[..9].copy_from_slice(b"../escape");
        header.set_cksum();
        let mut raw = header.as_bytes().to_vec();
        raw.extend_from_slice(b"evil");
        raw.resize(512 * 4, 0);

        let dir = tempfile::tempdir().unwrap();
        let err = TarFormat::new(None)
            .unpack_to_folder(&mut Cursor::new(raw), &dir.path().join("out"), &mut ProgressState::default())
            .unwrap_err();
        assert!(matches!(err, FormatError::UnsafePath(_)), "{err}");
        assert!(!dir.path().join("escape").exists());
    }
}
