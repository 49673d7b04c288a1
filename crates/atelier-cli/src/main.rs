//! Atelier command-line tools.

use anyhow::Result;
use atelier_core::EngineConfig;
use clap::Parser;

mod cli;
mod commands;

use crate::cli::{Cli, Command};

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Info { file, json } => commands::info(&file, json),
        Command::Verify { file } => commands::verify(&config, &file),
        Command::Unpack { file, out_dir } => commands::unpack(&config, &file, &out_dir),
        Command::Flatten { file, out } => commands::flatten(&config, &file, &out),
        Command::Recover { store, point, out } => pollster::block_on(commands::recover(
            &config,
            &store,
            point.as_deref(),
            out.as_deref(),
        )),
        Command::Config => commands::show_config(&config),
    }
}

fn main() {
    env_logger::init();

    if let Err(error) = run(Cli::parse()) {
        log::error!("{error:#}");
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}
