mod cli;
mod transfers;

use clap::Parser;
use cli::{Cli, Commands};
use ddcache_core::errors::find_transfer_error;
use log::{error, LevelFilter};
use std::process::ExitCode;
use transfers::{run_restore, run_save};

// clap already uses 2 for usage errors.
const EXIT_CACHE_MISS: u8 = 3;

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match &cli.command {
        Commands::Save(args) => run_save(args).await,
        Commands::Restore(args) => run_restore(args).await,
    };

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) if find_transfer_error(&err).is_some_and(|e| e.is_cache_miss()) => {
            error!("{err:#}");
            eprintln!("no cache entry found for the provided keys");
            Ok(ExitCode::from(EXIT_CACHE_MISS))
        }
        Err(err) => {
            error!("{err:#}");
            eprintln!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}
