//! Drives one list / extract / test operation end to end.
//!
//! ```text
//! Classifying ─▶ Resolved ─▶ Enumerating ─┬▶ Listing    ─┐
//!                                         ├▶ Extracting ─┼▶ Done
//!                                         └▶ Testing    ─┘
//!            (any stage) ─────────────────────────────────▶ Failed
//! ```
//!
//! Normal output goes to the writer handed to [`Orchestrator::new`];
//! diagnostics go through `tracing`.  The [`ProgressState`] passed to
//! [`Orchestrator::run`] is threaded into every long-running call.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::UnpackError;
use crate::format::{
    ArchiveFormat, CandidateSet, EnumerateMode, FileType, FormatError, Registry, Source, SourceHint,
};
use crate::listing::{self, ListFormat};
use crate::progress::ProgressState;
use crate::record;

/// Prefix of the scratch directory used by test mode.
pub const TEST_DIR_PREFIX: &str = "xunpack_test_";

/// Extract and test share the progress range between enumeration and unpack.
const UNPACK_PHASES: u32 = 2;

// ── Mode & options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    List,
    #[default]
    Extract,
    Test,
}

impl Mode {
    /// First set flag wins in the order list, test, extract; none means extract.
    pub fn from_flags(list: bool, extract: bool, test: bool) -> Self {
        match (list, test, extract) {
            (true, _, _) => Mode::List,
            (_, true, _) => Mode::Test,
            _            => Mode::Extract,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::List    => "list",
            Mode::Extract => "extract",
            Mode::Test    => "test",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extraction root; defaults to the input's directory.
    pub output_dir:  Option<PathBuf>,
    /// Where test mode creates its scratch directory; defaults to the system temp dir.
    pub temp_root:   Option<PathBuf>,
    pub list_format: ListFormat,
}

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Classifying,
    Resolved,
    Enumerating,
    Listing,
    Extracting,
    Testing,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The chosen type together with everything the classifier considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedType {
    pub chosen:     FileType,
    pub candidates: CandidateSet,
}

impl ResolvedType {
    /// `None` for an empty set, or when the registry prefers a type it never offered.
    pub fn resolve<R: Registry + ?Sized>(registry: &R, candidates: CandidateSet) -> Option<Self> {
        let chosen = registry.preferred(&candidates)?;
        candidates
            .contains(&chosen)
            .then_some(Self { chosen, candidates })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Listed    { file_type: FileType, records: usize },
    Extracted { file_type: FileType, destination: PathBuf, records: usize },
    Tested    { file_type: FileType, files: usize },
}

impl Outcome {
    pub fn file_type(&self) -> FileType {
        match self {
            Outcome::Listed { file_type, .. }
            | Outcome::Extracted { file_type, .. }
            | Outcome::Tested { file_type, .. } => *file_type,
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator<'a, R: Registry + ?Sized, W: Write> {
    registry: &'a R,
    out:      W,
    options:  Options,
    stage:    Stage,
    quiet:    bool,
}

impl<'a, R: Registry + ?Sized, W: Write> Orchestrator<'a, R, W> {
    pub fn new(registry: &'a R, out: W, options: Options) -> Self {
        Self { registry, out, options, stage: Stage::Idle, quiet: false }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Run one operation on `input`.  The progress state's observer is
    /// finished on every path.
    pub fn run(
        &mut self,
        input:    &Path,
        mode:     Mode,
        progress: &mut ProgressState,
    ) -> Result<Outcome, UnpackError> {
        self.quiet = mode == Mode::List && self.options.list_format == ListFormat::Json;
        debug!(path = %input.display(), %mode, "operation started");

        let result = self.execute(input, mode, progress);
        progress.finish();
        match &result {
            Ok(outcome) => {
                self.enter(Stage::Done);
                info!(file_type = %outcome.file_type(), "operation completed");
            }
            Err(e) => {
                self.enter(Stage::Failed);
                debug!(error = %e, "operation failed");
            }
        }
        result
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = %self.stage, to = %stage, "stage transition");
        self.stage = stage;
    }

    fn say(&mut self, line: fmt::Arguments<'_>) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        self.out.write_fmt(line)?;
        self.out.write_all(b"\n")
    }

    fn execute(
        &mut self,
        input:    &Path,
        mode:     Mode,
        progress: &mut ProgressState,
    ) -> Result<Outcome, UnpackError> {
        // ── Classifying ──────────────────────────────────────────────────────
        self.enter(Stage::Classifying);
        let metadata = fs::metadata(input).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => UnpackError::InputNotFound { path: input.to_path_buf() },
            _ => UnpackError::Open { path: input.to_path_buf(), source: e },
        })?;
        if !metadata.is_file() {
            return Err(UnpackError::InputNotAFile { path: input.to_path_buf() });
        }
        let absolute = fs::canonicalize(input).unwrap_or_else(|_| input.to_path_buf());
        self.say(format_args!("Processing file: {}", absolute.display()))?;
        self.say(format_args!("File size: {} bytes", metadata.len()))?;

        let file = fs::File::open(input)
            .map_err(|e| UnpackError::Open { path: input.to_path_buf(), source: e })?;
        let mut source = BufReader::new(file);

        let candidates = self
            .registry
            .classify(&mut source)
            .map_err(|e| UnpackError::Open { path: input.to_path_buf(), source: e })?;
        let resolved = ResolvedType::resolve(self.registry, candidates)
            .ok_or_else(|| UnpackError::UnsupportedFormat { path: input.to_path_buf(), file_type: None })?;
        let file_type = resolved.chosen;

        // ── Resolved ─────────────────────────────────────────────────────────
        self.enter(Stage::Resolved);
        debug!(chosen = %file_type, candidates = ?resolved.candidates, "type resolved");
        self.say(format_args!("File type: {file_type}"))?;

        let hint = SourceHint {
            stem: input.file_stem().map(|s| s.to_string_lossy().into_owned()),
            len:  metadata.len(),
        };
        let mut handler = self
            .registry
            .get_handler(file_type, &mut source, &hint)
            .ok_or_else(|| UnpackError::UnsupportedFormat {
                path:      input.to_path_buf(),
                file_type: Some(file_type),
            })?;
        let archive = handler.as_archive().ok_or_else(|| UnpackError::NotAnArchive {
            path: input.to_path_buf(),
            file_type,
        })?;

        // ── Enumerating ──────────────────────────────────────────────────────
        self.enter(Stage::Enumerating);
        let (enumerate_mode, phases) = match mode {
            Mode::List                 => (EnumerateMode::Full, 1),
            Mode::Extract | Mode::Test => (EnumerateMode::CountOnly, UNPACK_PHASES),
        };
        progress.begin_phase(0, phases);
        let records =
            record::enumerate(archive, &mut source, enumerate_mode, progress, input, file_type)?;
        progress.finish();
        self.say(format_args!("Number of records: {}", records.len()))?;

        let outcome = match mode {
            Mode::List => {
                self.enter(Stage::Listing);
                match self.options.list_format {
                    ListFormat::Text => listing::render_text(&mut self.out, &records)?,
                    ListFormat::Json => listing::render_json(&mut self.out, file_type, &records)?,
                }
                Outcome::Listed { file_type, records: records.len() }
            }
            Mode::Extract => {
                self.enter(Stage::Extracting);
                let destination = self.extract(archive, &mut source, input, &absolute, file_type, progress)?;
                self.say(format_args!("Extracted {} file(s) successfully", records.len()))?;
                Outcome::Extracted { file_type, destination, records: records.len() }
            }
            Mode::Test => {
                self.enter(Stage::Testing);
                let files = self.test(archive, &mut source, input, file_type, progress)?;
                Outcome::Tested { file_type, files }
            }
        };

        self.say(format_args!("Operation completed successfully"))?;
        Ok(outcome)
    }

    fn extract(
        &mut self,
        archive:   &mut dyn ArchiveFormat,
        source:    &mut dyn Source,
        input:     &Path,
        absolute:  &Path,
        file_type: FileType,
        progress:  &mut ProgressState,
    ) -> Result<PathBuf, UnpackError> {
        let output = match &self.options.output_dir {
            Some(dir) => dir.clone(),
            None      => absolute.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        self.say(format_args!("Extracting to: {}", output.display()))?;

        let stem = input.file_stem().unwrap_or(OsStr::new("extracted"));
        let destination = output.join(stem);
        let failed = |reason: String| UnpackError::ExtractionFailed {
            path: input.to_path_buf(),
            file_type,
            reason,
        };
        fs::create_dir_all(&destination).map_err(|e| {
            failed(format!("cannot create {}: {e}", destination.display()))
        })?;

        self.say(format_args!("Unpacking archive..."))?;
        progress.begin_phase(1, UNPACK_PHASES);
        let unpacked = archive.unpack_to_folder(source, &destination, progress);
        progress.finish();
        match unpacked {
            Ok(()) => {
                debug!(destination = %destination.display(), "archive unpacked");
                Ok(destination)
            }
            Err(FormatError::Cancelled) => Err(UnpackError::Cancelled),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    fn test(
        &mut self,
        archive:   &mut dyn ArchiveFormat,
        source:    &mut dyn Source,
        input:     &Path,
        file_type: FileType,
        progress:  &mut ProgressState,
    ) -> Result<usize, UnpackError> {
        let failed = |reason: String| UnpackError::TestFailed {
            path: input.to_path_buf(),
            file_type,
            reason,
        };
        self.say(format_args!("Testing archive integrity..."))?;

        let mut builder = tempfile::Builder::new();
        builder.prefix(TEST_DIR_PREFIX);
        let scratch = match &self.options.temp_root {
            Some(root) => builder.tempdir_in(root),
            None       => builder.tempdir(),
        }
        .map_err(|e| failed(format!("cannot create temporary directory: {e}")))?;
        self.say(format_args!(
            "Extracting to temporary location: {}",
            scratch.path().display()
        ))?;

        progress.begin_phase(1, UNPACK_PHASES);
        let unpacked = archive.unpack_to_folder(source, scratch.path(), progress);
        progress.finish();
        let files = match unpacked {
            Ok(()) => count_files(scratch.path()),
            Err(_) => 0,
        };

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(path = %scratch_path.display(), error = %e, "temporary directory not removed");
        }

        match unpacked {
            Err(FormatError::Cancelled) => Err(UnpackError::Cancelled),
            Err(e) => Err(failed(e.to_string())),
            Ok(()) if files == 0 => Err(failed("no files were extracted".into())),
            Ok(()) => {
                self.say(format_args!("Test PASSED: Successfully extracted {files} file(s)"))?;
                Ok(files)
            }
        }
    }
}

/// Regular files anywhere below `dir`.
fn count_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flag_means_extract() {
        assert_eq!(Mode::from_flags(false, false, false), Mode::Extract);
        assert_eq!(Mode::from_flags(false, true, false), Mode::Extract);
        assert_eq!(Mode::default(), Mode::Extract);
    }

    #[test]
    fn list_wins_then_test() {
        assert_eq!(Mode::from_flags(true, true, true), Mode::List);
        assert_eq!(Mode::from_flags(false, true, true), Mode::Test);
        assert_eq!(Mode::from_flags(true, false, true), Mode::List);
    }

    #[test]
    fn count_files_recurses() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.txt"), b"1").unwrap();
        fs::write(dir.path().join("a/b/deep.txt"), b"2").unwrap();
        assert_eq!(count_files(dir.path()), 2);
    }
}
