use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct IngestArgs {
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON array of interaction rows, or - for stdin"
    )]
    pub input: PathBuf,

    #[arg(long, help = "Rows per write transaction (overrides ingest.chunk_size)")]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct AggregateArgs {
    #[arg(long, help = "Sessions per call (overrides aggregate.batch_size)")]
    pub batch_size: Option<u32>,

    #[arg(
        long,
        default_value_t = 0,
        conflicts_with = "all",
        help = "Sessions to skip, in stable session order, before this call"
    )]
    pub skip_sessions: u64,

    #[arg(long, help = "Keep calling until the pass completes")]
    pub all: bool,

    #[arg(
        long,
        requires = "all",
        help = "Continue the pass from the persisted cursor"
    )]
    pub resume: bool,

    #[arg(long, requires = "all", help = "Stop the pass after this many calls")]
    pub max_calls: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct SessionizeArgs {
    #[arg(
        long,
        value_name = "PATH",
        help = "Headerless click log: session_id,timestamp,item_id[,category]"
    )]
    pub input: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        help = "Where to write the interaction batch JSON, or - for stdout"
    )]
    pub output: PathBuf,

    #[arg(long, help = "Drop sessions with fewer events than this")]
    pub min_session_length: Option<usize>,

    #[arg(long, help = "Drop items seen fewer times than this")]
    pub min_item_freq: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ReportArgs {
    #[arg(
        long,
        default_value_t = 10,
        help = "Rows per top-k listing (clamped to 1..200)"
    )]
    pub top: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Apply a batch of interaction rows to the graph
    Ingest(IngestArgs),
    /// Fold session item sets into co-occurrence weights
    Aggregate(AggregateArgs),
    /// Turn a raw click log into an interaction batch
    Sessionize(SessionizeArgs),
    /// Print graph totals and top-k listings
    Report(ReportArgs),
    /// Open the graph store and print its paths and state
    Check,
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Session/item co-occurrence graph builder")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding the .cograph directory"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[arg(long, short, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}
