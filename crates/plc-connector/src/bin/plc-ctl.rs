//! Command-line client.

#[path = "plc-ctl/cli.rs"]
mod cli;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indexmap::IndexMap;
use plc_connector::{Connector, PskStore, ServiceUri};
use plc_runtime::blob::program_digest;
use plc_runtime::debug::{decode_buffer, IecType, IecValue, TraceOrder};
use plc_runtime::log::LogLevel;

use cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let uri = ServiceUri::parse(&cli.uri)?;
    let psk = cli.psk_dir.as_ref().map(PskStore::new);
    let connector = Connector::connect(uri, psk)
        .with_context(|| format!("connect to {}", cli.uri))?;

    match cli.command {
        Command::Status => {
            let (state, counts) = connector.get_plc_status()?;
            println!(
                "state={state} critical={} warning={} info={} debug={}",
                counts[0], counts[1], counts[2], counts[3]
            );
        }
        Command::Start => println!("ok={}", connector.start_plc()?),
        Command::Stop => println!("ok={}", connector.stop_plc()?),
        Command::Reload => println!("ok={}", connector.force_reload()?),
        Command::Repair => println!("ok={}", connector.repair_plc()?),
        Command::Upload {
            file,
            digest,
            extra,
        } => {
            let binary =
                std::fs::read(&file).with_context(|| format!("read {}", file.display()))?;
            let digest = digest.unwrap_or_else(|| program_digest(&binary));
            let extra_files = extra
                .iter()
                .map(|spec| read_extra(spec))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let installed = connector.new_plc(&digest, &binary, &extra_files)?;
            println!("digest={digest} ok={installed}");
        }
        Command::Match { digest } => println!("match={}", connector.match_md5(&digest)?),
        Command::Trace {
            vars,
            count,
            interval,
        } => trace(&connector, &vars, count, Duration::from_millis(interval))?,
        Command::Log { level } => print_log(&connector, &level)?,
        Command::ResetLog => {
            connector.reset_log_count()?;
            println!("ok=true");
        }
        Command::Id => match connector.get_plc_id()? {
            Some(credentials) => println!("id={}", credentials.id),
            None => println!("id=none"),
        },
        Command::Exec { script, args } => {
            let text = std::fs::read_to_string(&script)
                .with_context(|| format!("read {}", script.display()))?;
            let kwargs = args
                .iter()
                .map(|arg| {
                    arg.split_once('=')
                        .map(|(name, value)| (name.to_string(), value.to_string()))
                        .with_context(|| format!("argument '{arg}' is not NAME=VALUE"))
                })
                .collect::<anyhow::Result<IndexMap<_, _>>>()?;
            let (code, message) = connector.remote_exec(&text, kwargs)?;
            println!("code={code}");
            if let Some(message) = message {
                println!("{message}");
            }
        }
        Command::Purge => {
            connector.purge_blobs()?;
            println!("ok=true");
        }
    }
    Ok(())
}

fn read_extra(spec: &str) -> anyhow::Result<(String, Vec<u8>)> {
    let Some((name, path)) = spec.split_once('=') else {
        bail!("extra file '{spec}' is not NAME=PATH");
    };
    let path = PathBuf::from(path);
    let data = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    Ok((name.to_string(), data))
}

fn parse_order(spec: &str) -> anyhow::Result<TraceOrder> {
    let (idx, rest) = spec
        .split_once(':')
        .with_context(|| format!("variable '{spec}' is not IDX:TYPE"))?;
    let idx: u32 = idx.parse().with_context(|| format!("index in '{spec}'"))?;
    let (ty, force) = match rest.split_once('=') {
        Some((ty, force)) => (ty, Some(force)),
        None => (rest, None),
    };
    let ty = IecType::parse(ty)?;
    let order = TraceOrder::new(idx, ty);
    Ok(match force {
        Some(text) => {
            let value = serde_json::from_str::<IecValue>(text)
                .unwrap_or_else(|_| IecValue::Text(text.to_string()));
            order.forced(value)
        }
        None => order,
    })
}

fn trace(
    connector: &Connector,
    vars: &[String],
    count: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    let orders = vars
        .iter()
        .map(|spec| parse_order(spec))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let types: Vec<IecType> = orders.iter().map(|order| order.iec_type).collect();
    if !connector.set_trace_variables_list(orders)? {
        bail!("service refused the trace list");
    }
    for _ in 0..count {
        let (state, samples) = connector.get_trace_variables()?;
        for sample in samples {
            match decode_buffer(&types, &sample.data) {
                Ok(values) => println!("tick={} values={}", sample.tick, serde_json::to_string(&values)?),
                Err(err) => println!("tick={} undecodable: {err}", sample.tick),
            }
        }
        if state != plc_runtime::PlcState::Started {
            println!("state={state}");
        }
        thread::sleep(interval);
    }
    Ok(())
}

fn print_log(connector: &Connector, level: &str) -> anyhow::Result<()> {
    let level = LogLevel::ALL
        .into_iter()
        .find(|candidate| format!("{candidate:?}").eq_ignore_ascii_case(level))
        .with_context(|| format!("unknown log level '{level}'"))?;
    let (_, counts) = connector.get_plc_status()?;
    for msg_id in 0..counts[level.index()] {
        if let Some(entry) = connector.get_log_message(level, msg_id)? {
            println!("[{}.{:09}] tick={} {}", entry.sec, entry.nsec, entry.tick, entry.message);
        }
    }
    Ok(())
}
