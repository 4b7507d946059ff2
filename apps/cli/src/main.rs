//! swift-drive-autopilot - keeps the drives of a Swift storage node encrypted,
//! identified and mounted.
//!
//! By default this runs as a long-lived service reacting to new drives,
//! periodic consistency checks and reinstated drives. With `--once` it runs a
//! single reconciliation pass and exits.

mod daemon;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use snafu::Report;
use tracing::error;

use swift_drive_autopilot_core::Config;

/// Swift storage node drive autopilot.
#[derive(Parser)]
#[command(name = "swift-drive-autopilot")]
#[command(about = "Encrypts, identifies and mounts the drives of a Swift storage node", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,

    /// Run a single reconciliation pass and exit.
    #[arg(long)]
    once: bool,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let result = Config::load(&cli.config).and_then(|config| {
        if cli.once {
            daemon::run_once(config)
        } else {
            daemon::run(config)
        }
    });

    match result {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::FAILURE,
        Err(err) => {
            error!("{}", Report::from_error(err));
            ExitCode::FAILURE
        }
    }
}
