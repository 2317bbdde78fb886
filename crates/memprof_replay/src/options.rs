use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use memprof::{config::DEFAULT_MAX_ACCESS_SIZE, Error, ProfilerConfig, ScopeTable};

/// Encoding of the recorded event log
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One event per line
    #[default]
    Text,
    /// `postcard` encoded list of events
    Postcard,
}

#[derive(Parser, Debug)]
#[command(
    name = "memprof_replay",
    version,
    about,
    long_about = "Replay a recorded memory event log and write the per-scope memory profile as CSV"
)]
pub struct ReplayOptions {
    #[arg(short, long, help = "Recorded event log")]
    pub input: PathBuf,

    #[arg(
        short,
        long,
        value_enum,
        default_value_t = LogFormat::Text,
        help = "Encoding of the event log"
    )]
    pub format: LogFormat,

    #[arg(
        short,
        long,
        default_value = "memory_profile.csv",
        help = "Where to write the CSV trace"
    )]
    pub output: PathBuf,

    #[arg(
        short,
        long = "scope",
        help = "Designated top-level scope, can be repeated. Without any, every scope in the log is tracked"
    )]
    pub scopes: Vec<String>,

    #[arg(long, help = "Cache line size in bytes [default: queried from the host]", value_parser = ReplayOptions::parse_size)]
    pub cache_line_size: Option<usize>,

    #[arg(long, help = "Largest access size with its own histogram bucket", default_value_t = DEFAULT_MAX_ACCESS_SIZE, value_parser = ReplayOptions::parse_size)]
    pub max_access_size: usize,

    #[arg(long, help = "Also write the parsed events as a postcard log")]
    pub export_events: Option<PathBuf>,
}

impl ReplayOptions {
    fn parse_size(src: &str) -> Result<usize, Error> {
        let size = match src.strip_prefix("0x") {
            Some(hex) => usize::from_str_radix(hex, 16)?,
            None => src.parse()?,
        };
        if size == 0 {
            return Err(Error::illegal_argument("size must not be zero"));
        }
        Ok(size)
    }

    /// Profiler settings chosen on the command line
    pub fn config(&self) -> Result<ProfilerConfig, Error> {
        let config = ProfilerConfig::default().with_max_access_size(self.max_access_size)?;
        match self.cache_line_size {
            Some(size) => config.with_cache_line_size(size),
            None => Ok(config),
        }
    }

    /// The designated scopes, empty if every scope should be tracked
    pub fn scope_table(&self) -> ScopeTable {
        let mut scopes = ScopeTable::new();
        for name in &self.scopes {
            scopes.register(name);
        }
        scopes
    }

    /// `true` if no scope was designated on the command line
    pub fn auto_register(&self) -> bool {
        self.scopes.is_empty()
    }
}
