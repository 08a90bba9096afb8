use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use serial_check_lib::report::{entries_between, RunReport};

/// Print every record of a saved run inside a time window, oldest first
#[derive(Debug, Parser)]
#[command(name = "extract-period", version, about)]
struct Cli {
    /// Results file written by serial-check -s
    file: PathBuf,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Start of the window, seconds into the run
    #[arg(short = 's', long, default_value_t = 0.0)]
    start: f64,

    /// End of the window, seconds into the run
    #[arg(short = 'e', long, default_value_t = 10.0)]
    end: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose > 0 { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let report = RunReport::read_from(&cli.file)
        .with_context(|| format!("Failed to load {}", cli.file.display()))?;
    log::debug!("run {} from {}", report.run_id, report.started_at);

    for entry in entries_between(&report, cli.start, cli.end) {
        println!("{}", entry);
    }
    Ok(())
}
