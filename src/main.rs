mod catalog;
mod cli;
mod dataset;
mod download;
mod error;
mod geo;
mod persist;
mod pipeline;
mod reading;
mod request;

use std::process::ExitCode;

use clap::Parser;
use cli::{command, Cli, Commands};
use pipeline::Outcome;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Hrrr(args) => command::hrrr(args).await,
        Commands::Ornl(args) => command::ornl(args).await,
        Commands::Prism(args) => command::prism(args).await,
        Commands::Snotel(args) => command::snotel(args).await,
        Commands::Wrf(args) => command::wrf(args).await,
    };

    match result {
        Ok(Outcome::Written(path)) => {
            println!("File saved to `{}`", path.display());
            ExitCode::SUCCESS
        }
        Ok(Outcome::Skipped(message)) => {
            println!("{}", message);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
