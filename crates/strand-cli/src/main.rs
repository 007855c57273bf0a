//! strand command-line runner
//!
//! Loads a scenario file, starts its services on a strand runtime and
//! runs until the root service exits.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;
mod programs;
mod scenario;

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Cooperative multi-service scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario until its root service exits
    Run {
        /// Scenario file (TOML)
        scenario: PathBuf,
        /// Override the worker count from the scenario
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Validate a scenario and print its service plan
    Check {
        /// Scenario file (TOML)
        scenario: PathBuf,
    },

    /// List built-in service programs
    Programs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "info" });

    match cli.command {
        Commands::Run { scenario, workers } => commands::run::execute(commands::run::RunArgs {
            scenario: &scenario,
            workers,
        }),
        Commands::Check { scenario } => commands::check::execute(&scenario),
        Commands::Programs => commands::programs::execute(),
    }
}
