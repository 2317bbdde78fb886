//! Replays a recorded memory event log through the profiler and writes the CSV trace.
//!
//! ```text
//! memprof_replay -i fft.log -s fft_initialise -o memory_profile.csv
//! ```
mod options;

use std::{fs, process::ExitCode};

use clap::Parser;
use log::{error, info};
use memprof::{
    events::{from_postcard, parse_event_log, to_postcard},
    CsvSink, Error, MemoryEvent, Replayer, ScopeController,
};

use crate::options::{LogFormat, ReplayOptions};

fn read_events(opts: &ReplayOptions) -> Result<Vec<MemoryEvent>, Error> {
    match opts.format {
        LogFormat::Text => parse_event_log(&fs::read_to_string(&opts.input)?),
        LogFormat::Postcard => from_postcard(&fs::read(&opts.input)?),
    }
}

fn replay(opts: &ReplayOptions) -> Result<(), Error> {
    let config = opts.config()?;
    let events = read_events(opts)?;
    info!(
        "{} events from {}, cache line size {}",
        events.len(),
        opts.input.display(),
        config.cache_line_size
    );

    if let Some(path) = &opts.export_events {
        fs::write(path, to_postcard(&events)?)?;
        info!("events written to {}", path.display());
    }

    let sink = CsvSink::create(&opts.output)?;
    let controller = ScopeController::new(config, opts.scope_table(), sink);
    let mut replayer = Replayer::new(controller, opts.auto_register());
    let result = replayer.run(&events);

    let controller = replayer.into_handler();
    let faults = controller.sink().faults();
    if faults > 0 {
        error!("{faults} merge faults in the trace");
    }
    info!(
        "trace for {} scopes written to {}",
        controller.scopes().len(),
        opts.output.display()
    );
    controller.into_sink().into_inner()?;
    result
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = ReplayOptions::parse();
    match replay(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("replay failed: {err}");
            ExitCode::FAILURE
        }
    }
}
