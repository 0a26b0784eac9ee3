//! Service entrypoint.

#[path = "plc-runtime/cli.rs"]
mod cli;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use smol_str::SmolStr;
use tracing::info;

use cli::Cli;
use plc_runtime::config::Binding;
use plc_runtime::loader::LoaderKind;
use plc_runtime::service::restart_process;
use plc_runtime::{ServiceConfig, ServiceContext};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let working_dir = match cli.working_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("current directory")?,
    };
    let config = apply_cli(
        ServiceConfig::discover(cli.config.as_deref(), &working_dir)?,
        &cli,
    );
    init_tracing(if cli.verbose { "debug" } else { &config.log_level });
    info!(working_dir = %working_dir.display(), "starting plc-runtime");

    let loader = config.loader.build();
    let service = ServiceContext::start(config, absolute(working_dir)?, loader)?;
    service.controller().set_reload_hook(restart_process);
    service.run()?;
    Ok(())
}

fn apply_cli(mut config: ServiceConfig, cli: &Cli) -> ServiceConfig {
    if let Some(name) = &cli.name {
        config.name = Some(SmolStr::new(name));
    }
    if let Some(interface) = &cli.interface {
        config.interface = SmolStr::new(interface);
    }
    if let Some(port) = cli.port {
        config.port = port;
        if cli.json_port.is_none() {
            config.json_port = port.saturating_add(1);
        }
    }
    if let Some(json_port) = cli.json_port {
        config.json_port = json_port;
        config.binding = match config.binding {
            Binding::Binary => Binding::Both,
            other => other,
        };
    }
    if cli.autostart {
        config.autostart = true;
    }
    if cli.simulate {
        config.loader = LoaderKind::Simulated;
    }
    config
}

fn absolute(dir: PathBuf) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create working directory {}", dir.display()))?;
    dir.canonicalize()
        .with_context(|| format!("resolve working directory {}", dir.display()))
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
