use clap::{ArgAction, Parser, ValueEnum};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xunpack::listing::ListFormat;
use xunpack::progress::{LineObserver, ProgressState};
use xunpack::{Formats, Mode, Options, Orchestrator};

#[derive(Parser)]
#[command(name = "xunpack", version, about = "Detect, list, extract or test an archive")]
struct Cli {
    /// Input file
    file: PathBuf,
    /// Extraction root (default: the input's directory)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Extract into <output>/<file stem> (default mode)
    #[arg(short = 'x', long)]
    extract: bool,
    /// List records
    #[arg(short, long)]
    list: bool,
    /// Unpack into a scratch directory and check that files come out
    #[arg(short, long)]
    test: bool,
    /// Listing format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
    /// Root for the test-mode scratch directory (default: system temp dir)
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    /// Minimum milliseconds between progress updates
    #[arg(long, default_value = "100")]
    progress_interval: u64,
    /// Do not draw the progress line
    #[arg(long)]
    no_progress: bool,
    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

impl From<Format> for ListFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Text => ListFormat::Text,
            Format::Json => ListFormat::Json,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mode = Mode::from_flags(cli.list, cli.extract, cli.test);
    let options = Options {
        output_dir:  cli.output,
        temp_root:   cli.temp_dir,
        list_format: cli.format.into(),
    };
    let json = matches!(cli.format, Format::Json) && mode == Mode::List;

    let mut progress = ProgressState::default()
        .with_min_interval(Duration::from_millis(cli.progress_interval));
    if !cli.no_progress && !json {
        progress = progress.with_observer(LineObserver::stderr());
    }

    let mut orchestrator = Orchestrator::new(&Formats, io::stdout().lock(), options);
    match orchestrator.run(&cli.file, mode, &mut progress) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

// ── Logging ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();
}
