//! compote - the ESP-IDF component manager CLI

use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use idf_component_manager::util::diagnostic::{emit, Diagnostic};
use idf_component_manager::util::errors::classify;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    let color = !cli.no_color && std::io::stderr().is_terminal();

    if let Err(e) = run(cli) {
        emit(&Diagnostic::from_error(&e), color);
        std::process::exit(classify(&e).exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("idf_component_manager=debug,compote=debug")
    } else {
        EnvFilter::new("idf_component_manager=info,compote=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Prepare(args) => commands::prepare::execute(args, cli.verbose),
        Commands::Cache(args) => commands::cache::execute(args),
    }
}
