use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use tempfile::TempDir;
use xunpack::format::{Codec, FileType};
use xunpack::listing::ListFormat;
use xunpack::progress::ProgressState;
use xunpack::{
    Formats, Mode, Options, Orchestrator, Outcome, ProgressObserver, Snapshot, UnpackError,
};

const README: &[u8] = b"read me first\n";
const NUMBERS: &[u8] = b"0123456789012345678901234567890123456789";

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn tar_bytes() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    builder.append_data(&mut dir, "docs/", std::io::empty()).unwrap();

    for (name, data) in [("docs/readme.txt", README), ("data/numbers.txt", NUMBERS)] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn zip_bytes(method: zip::CompressionMethod) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().compression_method(method);
    writer.add_directory("docs/", options).unwrap();
    writer.start_file("docs/readme.txt", options).unwrap();
    writer.write_all(README).unwrap();
    writer.start_file("data/numbers.txt", options).unwrap();
    writer.write_all(NUMBERS).unwrap();
    writer.finish().unwrap().into_inner()
}

fn compress(codec: Codec, data: &[u8]) -> Vec<u8> {
    match codec {
        Codec::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).unwrap();
            enc.finish().unwrap()
        }
        Codec::Zstd => zstd::encode_all(data, 3).unwrap(),
        Codec::Xz => {
            let mut out = Vec::new();
            lzma_rs::xz_compress(&mut &data[..], &mut out).unwrap();
            out
        }
        Codec::Lz4 => {
            let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
            enc.write_all(data).unwrap();
            enc.finish().unwrap()
        }
    }
}

/// GNU tar with names written verbatim, as `tar -C dir .` produces them.
fn dot_rooted_tar_bytes() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (kind, name, data) in [
        (tar::EntryType::Directory, &b"./"[..], &b""[..]),
        (tar::EntryType::Directory, &b"./docs/"[..], &b""[..]),
        (tar::EntryType::Regular, &b"./docs/readme.txt"[..], README),
        (tar::EntryType::Regular, &b"./data/numbers.txt"[..], NUMBERS),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// One stored entry with every size and offset pushed into ZIP64 records.
fn zip64_bytes(name: &str, data: &[u8]) -> Vec<u8> {
    const SATURATED: u32 = u32::MAX;
    let crc = crc32fast::hash(data);
    let name = name.as_bytes();
    let mut out = Vec::new();

    // local header + zip64 extra (uncompressed, compressed)
    out.extend_from_slice(b"PK\x03\x04");
    out.write_u16::<LittleEndian>(45).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0x21).unwrap();
    out.write_u32::<LittleEndian>(crc).unwrap();
    out.write_u32::<LittleEndian>(SATURATED).unwrap();
    out.write_u32::<LittleEndian>(SATURATED).unwrap();
    out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
    out.write_u16::<LittleEndian>(20).unwrap();
    out.extend_from_slice(name);
    out.write_u16::<LittleEndian>(0x0001).unwrap();
    out.write_u16::<LittleEndian>(16).unwrap();
    out.write_u64::<LittleEndian>(data.len() as u64).unwrap();
    out.write_u64::<LittleEndian>(data.len() as u64).unwrap();
    out.extend_from_slice(data);

    // central directory + zip64 extra (uncompressed, compressed, offset)
    let cd_offset = out.len() as u64;
    out.extend_from_slice(b"PK\x01\x02");
    out.write_u16::<LittleEndian>(45).unwrap();
    out.write_u16::<LittleEndian>(45).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0x21).unwrap();
    out.write_u32::<LittleEndian>(crc).unwrap();
    out.write_u32::<LittleEndian>(SATURATED).unwrap();
    out.write_u32::<LittleEndian>(SATURATED).unwrap();
    out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
    out.write_u16::<LittleEndian>(28).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(SATURATED).unwrap();
    out.extend_from_slice(name);
    out.write_u16::<LittleEndian>(0x0001).unwrap();
    out.write_u16::<LittleEndian>(24).unwrap();
    out.write_u64::<LittleEndian>(data.len() as u64).unwrap();
    out.write_u64::<LittleEndian>(data.len() as u64).unwrap();
    out.write_u64::<LittleEndian>(0).unwrap();
    let cd_size = out.len() as u64 - cd_offset;

    // zip64 end of central directory record
    let record_offset = out.len() as u64;
    out.extend_from_slice(b"PK\x06\x06");
    out.write_u64::<LittleEndian>(44).unwrap();
    out.write_u16::<LittleEndian>(45).unwrap();
    out.write_u16::<LittleEndian>(45).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u64::<LittleEndian>(1).unwrap();
    out.write_u64::<LittleEndian>(1).unwrap();
    out.write_u64::<LittleEndian>(cd_size).unwrap();
    out.write_u64::<LittleEndian>(cd_offset).unwrap();

    // locator
    out.extend_from_slice(b"PK\x06\x07");
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u64::<LittleEndian>(record_offset).unwrap();
    out.write_u32::<LittleEndian>(1).unwrap();

    // classic EOCD, fully saturated
    out.extend_from_slice(b"PK\x05\x06");
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(u16::MAX).unwrap();
    out.write_u16::<LittleEndian>(u16::MAX).unwrap();
    out.write_u32::<LittleEndian>(SATURATED).unwrap();
    out.write_u32::<LittleEndian>(SATURATED).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Snapshot>>>);

impl ProgressObserver for Recorder {
    fn on_progress(&mut self, snapshot: &Snapshot) {
        self.0.lock().unwrap().push(snapshot.clone());
    }
}

fn write_fixture(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, bytes).unwrap();
    path
}

fn run(input: &Path, mode: Mode, options: Options) -> (Result<Outcome, UnpackError>, String) {
    let mut out = Vec::new();
    let mut progress = ProgressState::default();
    let result = Orchestrator::new(&Formats, &mut out, options).run(input, mode, &mut progress);
    (result, String::from_utf8(out).unwrap())
}

fn extract_into(out: &Path) -> Options {
    Options { output_dir: Some(out.to_path_buf()), ..Options::default() }
}

fn test_under(root: &Path) -> Options {
    fs::create_dir_all(root).unwrap();
    Options { temp_root: Some(root.to_path_buf()), ..Options::default() }
}

fn assert_tree_extracted(root: &Path) {
    assert_eq!(fs::read(root.join("docs/readme.txt")).unwrap(), README);
    assert_eq!(fs::read(root.join("data/numbers.txt")).unwrap(), NUMBERS);
}

fn assert_empty_dir(dir: &Path) {
    assert_eq!(fs::read_dir(dir).unwrap().count(), 0, "{} not cleaned up", dir.display());
}

/// List, extract and test one multi-file archive fixture.
fn check_tree_archive(file_name: &str, bytes: &[u8], expected: FileType) {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, file_name, bytes);

    let (listed, text) = run(&input, Mode::List, Options::default());
    assert_eq!(listed.unwrap(), Outcome::Listed { file_type: expected, records: 3 });
    assert!(text.contains(&format!("File type: {expected}")), "{text}");
    assert!(text.contains("Total: 3 file(s)"), "{text}");
    assert!(text.contains("docs/readme.txt"), "{text}");

    let out = dir.path().join("out");
    let (extracted, text) = run(&input, Mode::Extract, extract_into(&out));
    let Outcome::Extracted { destination, records, .. } = extracted.unwrap() else {
        panic!("not an extraction");
    };
    assert_eq!(records, 3);
    assert_eq!(destination, out.join(Path::new(file_name).file_stem().unwrap()));
    assert_tree_extracted(&destination);
    assert!(text.contains("Extracted 3 file(s) successfully"), "{text}");

    let scratch = dir.path().join("scratch");
    let (tested, text) = run(&input, Mode::Test, test_under(&scratch));
    assert_eq!(tested.unwrap(), Outcome::Tested { file_type: expected, files: 2 });
    assert!(text.contains("Test PASSED: Successfully extracted 2 file(s)"), "{text}");
    assert_empty_dir(&scratch);
}

// ── Archives ─────────────────────────────────────────────────────────────────

#[test]
fn test_zip_deflated() {
    check_tree_archive("bundle.zip", &zip_bytes(zip::CompressionMethod::Deflated), FileType::Zip);
}

#[test]
fn test_zip_stored() {
    check_tree_archive("bundle.zip", &zip_bytes(zip::CompressionMethod::Stored), FileType::Zip);
}

#[test]
fn test_plain_tar() {
    check_tree_archive("bundle.tar", &tar_bytes(), FileType::Tar);
}

#[test]
fn test_compressed_tarballs() {
    for (name, codec) in [
        ("bundle.tar.gz", Codec::Gzip),
        ("bundle.tar.zst", Codec::Zstd),
        ("bundle.tar.xz", Codec::Xz),
        ("bundle.tar.lz4", Codec::Lz4),
    ] {
        check_tree_archive(name, &compress(codec, &tar_bytes()), FileType::CompressedTar(codec));
    }
}

#[test]
fn test_dot_rooted_tarball() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "site.tar", &dot_rooted_tar_bytes());

    let (listed, _) = run(&input, Mode::List, Options::default());
    assert_eq!(listed.unwrap(), Outcome::Listed { file_type: FileType::Tar, records: 4 });

    let out = dir.path().join("out");
    let (extracted, _) = run(&input, Mode::Extract, extract_into(&out));
    let Outcome::Extracted { destination, .. } = extracted.unwrap() else {
        panic!("not an extraction");
    };
    assert_tree_extracted(&destination);

    let scratch = dir.path().join("scratch");
    let (tested, _) = run(&input, Mode::Test, test_under(&scratch));
    assert_eq!(tested.unwrap(), Outcome::Tested { file_type: FileType::Tar, files: 2 });
    assert_empty_dir(&scratch);
}

#[test]
fn test_zip64_records() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "wide.zip", &zip64_bytes("wide/numbers.txt", NUMBERS));

    let (listed, text) = run(&input, Mode::List, Options::default());
    assert_eq!(listed.unwrap(), Outcome::Listed { file_type: FileType::Zip, records: 1 });
    let row: Vec<&str> = text
        .lines()
        .find(|l| l.starts_with("wide/numbers.txt"))
        .unwrap()
        .split_whitespace()
        .collect();
    let size = NUMBERS.len().to_string();
    let crc = format!("{:X}", crc32fast::hash(NUMBERS));
    assert_eq!(row, ["wide/numbers.txt", size.as_str(), size.as_str(), crc.as_str()]);

    let out = dir.path().join("out");
    run(&input, Mode::Extract, extract_into(&out)).0.unwrap();
    assert_eq!(fs::read(out.join("wide/wide/numbers.txt")).unwrap(), NUMBERS);
}

#[test]
fn test_self_extracting_zip_with_stub() {
    let mut bytes = b"#!/bin/sh\necho self-extracting stub\nexit 0\n".to_vec();
    bytes.resize(300, b'#');
    bytes.extend_from_slice(&zip_bytes(zip::CompressionMethod::Deflated));
    check_tree_archive("installer.run", &bytes, FileType::Zip);
}

#[test]
fn test_bare_streams() {
    for (name, codec) in [
        ("notes.txt.zst", Codec::Zstd),
        ("notes.txt.xz", Codec::Xz),
        ("notes.txt.lz4", Codec::Lz4),
        ("notes.txt.gz", Codec::Gzip),
    ] {
        let dir = TempDir::new().unwrap();
        let input = write_fixture(&dir, name, &compress(codec, README));
        let file_type = FileType::Compressed(codec);

        let (listed, text) = run(&input, Mode::List, Options::default());
        assert_eq!(listed.unwrap(), Outcome::Listed { file_type, records: 1 });
        let crc = format!("{:X}", crc32fast::hash(README));
        assert!(text.contains(&crc), "{name}: {text}");
        assert!(text.contains("notes.txt"), "{name}: {text}");

        let out = dir.path().join("out");
        let (extracted, _) = run(&input, Mode::Extract, extract_into(&out));
        extracted.unwrap();
        assert_eq!(fs::read(out.join("notes.txt").join("notes.txt")).unwrap(), README, "{name}");

        let scratch = dir.path().join("scratch");
        let (tested, _) = run(&input, Mode::Test, test_under(&scratch));
        assert_eq!(tested.unwrap(), Outcome::Tested { file_type, files: 1 });
        assert_empty_dir(&scratch);
    }
}

#[test]
fn test_gzip_embedded_name_is_used() {
    let mut enc = flate2::GzBuilder::new()
        .filename("original.csv")
        .write(Vec::new(), flate2::Compression::default());
    enc.write_all(NUMBERS).unwrap();
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "renamed.gz", &enc.finish().unwrap());

    let (listed, text) = run(&input, Mode::List, Options::default());
    listed.unwrap();
    assert!(text.contains("original.csv"), "{text}");

    let out = dir.path().join("out");
    run(&input, Mode::Extract, extract_into(&out)).0.unwrap();
    assert_eq!(fs::read(out.join("renamed/original.csv")).unwrap(), NUMBERS);
}

#[test]
fn test_json_listing() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "bundle.tar", &tar_bytes());
    let options = Options { list_format: ListFormat::Json, ..Options::default() };

    let (listed, text) = run(&input, Mode::List, options);
    listed.unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(doc["file_type"], "TAR");
    assert_eq!(doc["total"], 3);
    assert_eq!(doc["records"][1]["name"], "docs/readme.txt");
    assert_eq!(doc["records"][1]["uncompressed_size"], README.len());
    assert_eq!(doc["records"][0]["properties"]["is_folder"], true);
}

#[test]
fn test_default_mode_is_extract() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "bundle.tar", &tar_bytes());

    let mode = Mode::from_flags(false, false, false);
    let (result, text) = run(&input, mode, Options::default());
    let Outcome::Extracted { destination, .. } = result.unwrap() else {
        panic!("default mode did not extract");
    };
    assert_eq!(destination, fs::canonicalize(dir.path()).unwrap().join("bundle"));
    assert_tree_extracted(&destination);
    assert!(text.contains("Unpacking archive..."));
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[test]
fn test_corrupted_entry_fails_crc() {
    let mut bytes = zip_bytes(zip::CompressionMethod::Stored);
    let at = bytes.windows(NUMBERS.len()).position(|w| w == NUMBERS).unwrap();
    bytes[at] ^= 0xFF;

    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "broken.zip", &bytes);

    // The central directory is intact, so listing still works.
    run(&input, Mode::List, Options::default()).0.unwrap();

    let (result, _) = run(&input, Mode::Extract, extract_into(&dir.path().join("out")));
    match result {
        Err(UnpackError::ExtractionFailed { file_type, reason, .. }) => {
            assert_eq!(file_type, FileType::Zip);
            assert!(reason.contains("CRC mismatch in data/numbers.txt"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }

    let scratch = dir.path().join("scratch");
    let (result, _) = run(&input, Mode::Test, test_under(&scratch));
    assert!(matches!(result, Err(UnpackError::TestFailed { .. })), "{result:?}");
    assert_empty_dir(&scratch);
}

#[test]
fn test_zip_slip_entry_is_rejected() {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    writer.start_file("../evil.txt", options).unwrap();
    writer.write_all(b"evil").unwrap();
    let bytes = writer.finish().unwrap().into_inner();

    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "slip.zip", &bytes);
    let out = dir.path().join("out");

    let (result, _) = run(&input, Mode::Extract, extract_into(&out));
    match result {
        Err(UnpackError::ExtractionFailed { reason, .. }) => {
            assert!(reason.contains("unsafe entry path: ../evil.txt"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!out.join("evil.txt").exists());
    assert!(!dir.path().join("evil.txt").exists());
}

#[test]
fn test_extraction_progress_climbs_below_full() {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for i in 0..4u8 {
        writer.start_file(format!("part{i}.bin"), options).unwrap();
        let chunk: Vec<u8> = (0..200_000u32).map(|n| (n % 251) as u8 ^ i).collect();
        writer.write_all(&chunk).unwrap();
    }
    let bytes = writer.finish().unwrap().into_inner();

    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "parts.zip", &bytes);
    let recorder = Recorder::default();
    let mut progress = ProgressState::default()
        .with_min_interval(Duration::ZERO)
        .with_observer(recorder.clone());

    let mut out = Vec::new();
    Orchestrator::new(&Formats, &mut out, extract_into(&dir.path().join("out")))
        .run(&input, Mode::Extract, &mut progress)
        .unwrap();

    let percents: Vec<u8> = recorder.0.lock().unwrap().iter().map(|s| s.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.last(), Some(&100));
    // Enumeration tops out at half; extraction fills the rest.
    let first_full = percents.iter().position(|&p| p == 100).unwrap();
    assert!(percents[..first_full].contains(&50), "{percents:?}");
    assert!(percents.iter().any(|&p| p > 50 && p < 100), "{percents:?}");
}

#[test]
fn test_elf_is_not_an_archive() {
    let mut elf = b"\x7FELF\x02\x01\x01\x00".to_vec();
    elf.resize(256, 0);
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "tool", &elf);

    let (result, text) = run(&input, Mode::List, Options::default());
    assert!(
        matches!(result, Err(UnpackError::NotAnArchive { file_type: FileType::Elf, .. })),
        "{result:?}"
    );
    assert!(text.contains("File type: ELF"));
}

#[test]
fn test_unrecognised_input_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "noise.bin", &[0x5Au8; 4096]);
    let (result, _) = run(&input, Mode::Extract, Options::default());
    assert!(matches!(result, Err(UnpackError::UnsupportedFormat { .. })), "{result:?}");
    assert!(!dir.path().join("noise").exists());
}

#[test]
fn test_empty_zip_reports_no_records() {
    let writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let bytes = writer.finish().unwrap().into_inner();
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "empty.zip", &bytes);

    let (result, _) = run(&input, Mode::List, Options::default());
    assert!(matches!(result, Err(UnpackError::EmptyArchive { file_type: FileType::Zip, .. })));
}

#[test]
fn test_missing_and_directory_inputs() {
    let dir = TempDir::new().unwrap();

    let (result, _) = run(&dir.path().join("absent.zip"), Mode::List, Options::default());
    assert!(matches!(result, Err(UnpackError::InputNotFound { .. })));

    let (result, _) = run(dir.path(), Mode::List, Options::default());
    let err = result.unwrap_err();
    assert!(matches!(err, UnpackError::InputNotAFile { .. }));
    assert!(err.to_string().starts_with("Not a file: "));
}

#[test]
fn test_cancelled_before_start() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "bundle.zip", &zip_bytes(zip::CompressionMethod::Deflated));

    let mut progress = ProgressState::default();
    progress.request_cancel();
    let mut out = Vec::new();
    let result = Orchestrator::new(&Formats, &mut out, extract_into(&dir.path().join("out")))
        .run(&input, Mode::Extract, &mut progress);
    assert!(matches!(result, Err(UnpackError::Cancelled)), "{result:?}");
}
