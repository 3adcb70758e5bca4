mod cli;
mod error;
mod output;
mod probe;

use std::{io, process};

use clap::Parser;
use tracing::{Level, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use vela_engine::Engine;

use crate::cli::{Args, Commands, LogFormat};
use crate::error::Result;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, args.log_format);

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Probe(probe) => probe::run(probe).await,
        Commands::Detect { url } => {
            println!("{}", Engine::is_supported(&url));
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, quiet: bool, format: LogFormat) {
    let filter = if quiet {
        EnvFilter::new("warn")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let subscriber = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(verbose)
                    .with_writer(io::stderr),
            )
            .init(),
    }
}
