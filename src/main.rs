//! reeprom - I2C bus debugger and EEPROM programmer
//!
//! Talks to serial EEPROMs (24Cxx and friends) through pluggable bus
//! adapters. The same command implementations work against any adapter;
//! the build always carries a simulated bus for offline work, and real
//! bridge drivers slot in behind the same trait.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use reeprom_core::chip::ChipRegistry;
use std::path::{Path, PathBuf};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let registry = match load_chip_registry(cli.chip_db.as_deref()) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Failed to load chip descriptors: {}", e);
            std::process::exit(1);
        }
    };

    log::info!("Loaded {} chip descriptors", registry.len());

    let result = match cli.command {
        Commands::Scan { adapter } => commands::run_scan(&adapter),
        Commands::Chips => commands::run_chips(&registry),
        Commands::Read {
            adapter,
            target,
            offset,
            length,
            output,
        } => commands::run_read(&registry, &adapter, &target, offset, length, &output),
        Commands::Write {
            adapter,
            target,
            offset,
            input,
            no_verify,
        } => commands::run_write(&registry, &adapter, &target, offset, &input, !no_verify),
        Commands::Verify {
            adapter,
            target,
            offset,
            input,
        } => commands::run_verify(&registry, &adapter, &target, offset, &input),
        Commands::Erase {
            adapter,
            target,
            fill,
        } => commands::run_erase(&registry, &adapter, &target, fill),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Load chip descriptors: the builtin 24Cxx table, plus user descriptors
/// from an explicit path or the default `chips/` directory when present.
fn load_chip_registry(path: Option<&Path>) -> Result<ChipRegistry, Box<dyn std::error::Error>> {
    let mut registry = ChipRegistry::builtin();

    if let Some(path) = path {
        // User specified a path
        if path.is_dir() {
            registry.load_dir(path)?;
        } else {
            return Err(format!("Chip descriptor path not found: {}", path.display()).into());
        }
    } else {
        let default_dir = PathBuf::from("chips");
        if default_dir.is_dir() {
            match registry.load_dir(&default_dir) {
                Ok(count) => log::debug!("Loaded {} descriptors from {}", count, default_dir.display()),
                Err(e) => log::warn!("Ignoring {}: {}", default_dir.display(), e),
            }
        }
    }

    Ok(registry)
}
