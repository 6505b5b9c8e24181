//! Detect, list, extract and test archive containers.
//!
//! ```no_run
//! use std::path::Path;
//! use xunpack::format::Formats;
//! use xunpack::orchestrator::{Mode, Options, Orchestrator};
//! use xunpack::progress::ProgressState;
//!
//! let mut progress = ProgressState::default();
//! let mut orchestrator = Orchestrator::new(&Formats, std::io::stdout(), Options::default());
//! orchestrator.run(Path::new("bundle.tar.gz"), Mode::List, &mut progress)?;
//! # Ok::<(), xunpack::UnpackError>(())
//! ```

pub mod error;
pub mod format;
pub mod listing;
pub mod orchestrator;
pub mod progress;
pub mod record;

pub use error::UnpackError;
pub use format::{ArchiveFormat, FileType, Formats, Handler, Registry};
pub use orchestrator::{Mode, Options, Orchestrator, Outcome};
pub use progress::{ProgressObserver, ProgressState, Snapshot};
pub use record::{ArchiveRecord, PropertyKey, PropertyValue};
