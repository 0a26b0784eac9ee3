//! CLI definitions for plc-runtime.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "plc-runtime",
    version,
    about = "PLC program execution service",
    after_help = "Examples:\n  plc-runtime ./work                     # serve on localhost:3000\n  plc-runtime -i 0.0.0.0 -n line-3 ./work  # serve on all interfaces and announce\n  plc-runtime --simulate -a ./work        # simulated programs, autostart"
)]
pub struct Cli {
    /// Name announced on the local network.
    #[arg(short = 'n', long)]
    pub name: Option<String>,
    /// Interface (IP address) to bind.
    #[arg(short = 'i', long)]
    pub interface: Option<String>,
    /// Port of the binary binding.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,
    /// Port of the JSON binding (enables it).
    #[arg(short = 'j', long)]
    pub json_port: Option<u16>,
    /// Start the installed program after loading it.
    #[arg(short = 'a', long)]
    pub autostart: bool,
    /// Load simulated program artifacts instead of shared libraries.
    #[arg(long)]
    pub simulate: bool,
    /// Configuration file (defaults to <working_dir>/service.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
    /// Directory holding the installed program.
    pub working_dir: Option<PathBuf>,
}
