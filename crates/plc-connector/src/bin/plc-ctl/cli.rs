//! CLI definitions for plc-ctl.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "plc-ctl",
    version,
    about = "Control a plc-runtime service",
    after_help = "Examples:\n  plc-ctl status\n  plc-ctl --uri BIN://10.0.0.5:3000 upload build/plc.so\n  plc-ctl trace --var 0:INT --var 3:BOOL=true --count 20"
)]
pub struct Cli {
    /// Service URI (BIN://host:port#ID or JSON://host:port#ID).
    #[arg(long, default_value = "BIN://localhost:3000")]
    pub uri: String,
    /// Directory holding the `psk/` identity store.
    #[arg(long)]
    pub psk_dir: Option<PathBuf>,
    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the PLC state and log counts.
    Status,
    /// Start the installed program.
    Start,
    /// Stop the running program.
    Stop,
    /// Restart the service process.
    Reload,
    /// Uninstall the program and stop the service.
    Repair,
    /// Upload and install a program.
    Upload {
        /// Program binary.
        file: PathBuf,
        /// Digest to install under (defaults to the binary's digest).
        #[arg(long)]
        digest: Option<String>,
        /// Extra file shipped with the program, as NAME=PATH.
        #[arg(long = "extra")]
        extra: Vec<String>,
    },
    /// Check whether a digest names the installed program.
    Match {
        digest: String,
    },
    /// Trace variables of the running program.
    Trace {
        /// Variable as IDX:TYPE or IDX:TYPE=FORCE (FORCE is a JSON literal).
        #[arg(long = "var", required = true)]
        vars: Vec<String>,
        /// Number of polls.
        #[arg(long, default_value = "10")]
        count: u32,
        /// Delay between polls in milliseconds.
        #[arg(long, default_value = "200")]
        interval: u64,
    },
    /// Print PLC log messages.
    Log {
        /// Level: critical, warning, info or debug.
        #[arg(long, default_value = "critical")]
        level: String,
    },
    /// Reset the PLC log counters.
    ResetLog,
    /// Show the service identity and record it in the PSK store.
    Id,
    /// Run a RemoteExec script.
    Exec {
        /// Script file.
        script: PathBuf,
        /// Keyword argument as NAME=VALUE.
        #[arg(long = "arg")]
        args: Vec<String>,
    },
    /// Discard pending uploads.
    Purge,
}
