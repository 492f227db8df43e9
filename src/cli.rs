//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use reeprom_session::adapter_names;

/// Parse a string as a hex or decimal u32
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a string as a hex or decimal u8
fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let value = parse_hex_u32(s)?;
    u8::try_from(value).map_err(|_| format!("Value {} does not fit in a byte", value))
}

/// Generate dynamic help text for the adapter argument
fn adapter_help() -> String {
    format!("Adapter to use [available: {}]", adapter_names().join(", "))
}

#[derive(Parser)]
#[command(name = "reeprom")]
#[command(author, version, about = "I2C bus debugger and EEPROM programmer", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to chip descriptor directory (contains .ron files).
    /// Defaults to ./chips/ when present; builtin 24Cxx parts are always loaded.
    #[arg(long, global = true)]
    pub chip_db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Adapter options shared across commands
#[derive(clap::Args, Debug, Clone)]
pub struct AdapterArgs {
    /// Adapter to use, e.g. "sim" or "sim:addr=0x50,size=32768"
    #[arg(short, long, help = adapter_help())]
    pub adapter: String,

    /// Bus speed in kHz (adapter default if omitted)
    #[arg(long)]
    pub speed: Option<u32>,
}

/// Chip/device options shared across EEPROM commands
#[derive(clap::Args, Debug, Clone)]
pub struct TargetArgs {
    /// Chip descriptor id (see `reeprom chips`)
    #[arg(short, long)]
    pub chip: String,

    /// Device bus address
    #[arg(long, value_parser = parse_hex_u8, default_value = "0x50")]
    pub address: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan the bus for responding devices
    Scan {
        #[command(flatten)]
        adapter: AdapterArgs,
    },

    /// List known chip descriptors
    Chips,

    /// Read EEPROM contents to file
    Read {
        #[command(flatten)]
        adapter: AdapterArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Start offset within the chip
        #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
        offset: u32,

        /// Bytes to read (defaults to the rest of the chip)
        #[arg(long, value_parser = parse_hex_u32)]
        length: Option<u32>,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write file contents to EEPROM
    Write {
        #[command(flatten)]
        adapter: AdapterArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Start offset within the chip
        #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
        offset: u32,

        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Skip the readback verify pass
        #[arg(long)]
        no_verify: bool,
    },

    /// Compare EEPROM contents against a file
    Verify {
        #[command(flatten)]
        adapter: AdapterArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Start offset within the chip
        #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
        offset: u32,

        /// File with the expected contents
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Fill the entire EEPROM with a byte value
    Erase {
        #[command(flatten)]
        adapter: AdapterArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Fill value
        #[arg(long, value_parser = parse_hex_u8, default_value = "0xFF")]
        fill: u8,
    },
}
