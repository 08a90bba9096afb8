use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser};
use env_logger::Env;
use log::LevelFilter;

use serial_check_lib::clock::RunClock;
use serial_check_lib::config::HarnessConfig;
use serial_check_lib::device::DeviceManager;
use serial_check_lib::flash;
use serial_check_lib::listener::PassiveListener;
use serial_check_lib::report::{board_summary, RunReport};
use serial_check_lib::scheduler::SHUTDOWN_GRACE;

/// Run a timed test across every board in a harness configuration
#[derive(Debug, Parser)]
#[command(name = "serial-check", version, about)]
struct Cli {
    /// Harness configuration (JSON)
    config: PathBuf,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Seconds to log for
    #[arg(short = 'd', long, default_value_t = 60)]
    duration: u64,

    /// Save results to this file
    #[arg(short = 's', long = "save-results", value_name = "FILE")]
    save_results: Option<PathBuf>,

    /// Erase and reflash every board from this build directory first
    #[arg(long, value_name = "DIR")]
    flash: Option<PathBuf>,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = HarnessConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    if let Some(dir) = &cli.flash {
        for board in &config.boards {
            flash::prepare(board, dir)
                .await
                .with_context(|| format!("Failed to flash {}", board.name))?;
        }
    }

    let clock = RunClock::start();
    let mut manager = DeviceManager::new(clock);
    manager
        .connect_all(&config.boards)
        .context("Failed to open a board's serial port")?;

    let mut listeners = Vec::new();
    for sniffer in &config.sniffers {
        match PassiveListener::connect(&sniffer.address, sniffer.port, clock).await {
            Ok(listener) => listeners.push(listener),
            Err(e) => log::error!("Listener {}:{} unavailable: {}", sniffer.address, sniffer.port, e),
        }
    }

    manager.link_events(&config.links);

    let started_at = Utc::now();
    eprintln!("## Started at {}, {}s run", started_at.format("%Y-%m-%d %H:%M:%S%.3f"), cli.duration);
    manager.start_all();
    for listener in &listeners {
        listener.set_recording(true);
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.duration)) => {}
        res = tokio::signal::ctrl_c() => {
            match res {
                Ok(()) => {
                    eprintln!("\n#####################################");
                    eprintln!("# Keyboard Interrupt detected after {:.1}s", clock.now());
                }
                Err(e) => log::error!("Unable to listen for Ctrl-C: {}", e),
            }
        }
    }

    println!("\n#####################################");
    manager.shutdown_all(SHUTDOWN_GRACE).await;
    let mut threads = Vec::new();
    for listener in listeners {
        threads.push(listener.stop().await);
    }

    if let Some(path) = &cli.save_results {
        eprintln!("# Writing results to file");
        let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
        let mut report = RunReport::new(started_at, cmdline);
        report.boards = manager.snapshots();
        report.threads = threads;
        report
            .write_to(path)
            .with_context(|| format!("Failed to save results to {}", path.display()))?;
    }

    println!("\n#####################################");
    for board in manager.boards() {
        let monitor = board.monitor();
        let summary = board_summary(
            &monitor.serialize_state(),
            monitor.variant().stat_categories(),
            &monitor.run_checks(),
            cli.verbose,
        );
        print!("{}", summary);
    }

    Ok(())
}
