use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::format::{FileType, FormatError};

/// Terminal failure of one list / extract / test invocation.
///
/// Every variant carries enough context (input path, detected type) to
/// reproduce the failure from the message alone.
#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("File not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("Not a file: {}", path.display())]
    InputNotAFile { path: PathBuf },

    #[error("Cannot open file: {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    /// `file_type` is set when a type was resolved but no handler exists for it.
    #[error("Not an archive or unsupported format: {}{}", path.display(), detected(file_type))]
    UnsupportedFormat { path: PathBuf, file_type: Option<FileType> },

    #[error("Not an archive format: {file_type} ({})", path.display())]
    NotAnArchive { path: PathBuf, file_type: FileType },

    #[error("Archive contains no records: {} ({file_type})", path.display())]
    EmptyArchive { path: PathBuf, file_type: FileType },

    #[error("Cannot read {file_type} records from {}: {source}", path.display())]
    Enumeration {
        path:      PathBuf,
        file_type: FileType,
        source:    FormatError,
    },

    #[error("Failed to extract archive {} ({file_type}): {reason}", path.display())]
    ExtractionFailed {
        path:      PathBuf,
        file_type: FileType,
        reason:    String,
    },

    #[error("Test FAILED: could not extract archive {} ({file_type}): {reason}", path.display())]
    TestFailed {
        path:      PathBuf,
        file_type: FileType,
        reason:    String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cannot write output: {0}")]
    Output(#[from] io::Error),
}

impl UnpackError {
    /// The container type detected before the failure, when one was resolved.
    pub fn file_type(&self) -> Option<FileType> {
        match self {
            UnpackError::UnsupportedFormat { file_type, .. } => *file_type,
            UnpackError::NotAnArchive { file_type, .. }
            | UnpackError::EmptyArchive { file_type, .. }
            | UnpackError::Enumeration { file_type, .. }
            | UnpackError::ExtractionFailed { file_type, .. }
            | UnpackError::TestFailed { file_type, .. } => Some(*file_type),
            _ => None,
        }
    }
}

fn detected(file_type: &Option<FileType>) -> String {
    file_type.map(|ft| format!(" ({ft})")).unwrap_or_default()
}
