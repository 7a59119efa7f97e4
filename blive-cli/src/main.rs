mod cli;
mod commands;
mod config;
mod error;
mod output;

use crate::{
    cli::{Args, Commands},
    commands::Console,
    config::AppConfig,
    error::{AppError, Result},
};
use clap::Parser;
use std::process;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        output::failure(&e.to_string());
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let Args {
        command,
        config: config_path,
        sessdata,
        ..
    } = args;

    match command {
        Commands::Config { show, reset } => {
            if reset {
                AppConfig::reset(config_path.as_deref())?;
                output::success("Configuration reset to defaults");
            } else if show {
                let config = AppConfig::load(config_path.as_deref())?;
                println!("{}", config.show()?);
            } else {
                println!(
                    "Use --show to display current configuration or --reset to reset to defaults"
                );
            }
        }
        Commands::Listen { room, raw } => {
            let config = load_config(config_path.as_deref(), sessdata.as_deref())?;
            commands::listen(config, room.as_deref(), raw).await?;
        }
        Commands::Interactive => {
            let config = load_config(config_path.as_deref(), sessdata.as_deref())?;
            Console::new(config, config_path, sessdata).run().await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>, sessdata: Option<&str>) -> Result<AppConfig> {
    let mut config = AppConfig::load(path)?;
    if let Some(sessdata) = sessdata {
        config.blive.sessdata = Some(sessdata.to_string());
    }
    Ok(config)
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let default = if quiet {
        "blive=warn,blive_danmu=warn"
    } else if verbose {
        "blive=debug,blive_danmu=debug"
    } else {
        "blive=info,blive_danmu=info"
    };
    // RUST_LOG wins over the flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose))
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
