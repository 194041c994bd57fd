use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use nova_dap_client::{
    AdapterCommand, BreakpointAttributes, BreakpointSynchronizer, DebugSession,
    InMemoryBreakpointStore, LaunchKind, SessionEvent, SessionOptions, ShutdownCoordinator,
    StopKind, WireAdapter, WireAdapterConfig,
};

/// Run a program under a Debug Adapter Protocol adapter.
///
/// Spawns the adapter (or connects to one over TCP), sets the given
/// breakpoints, launches, and prints lifecycle events until the debuggee
/// terminates or Ctrl-C is pressed.
#[derive(Debug, Parser)]
#[command(name = "nova-debug", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `NOVA_CONFIG` is used as a fallback. When neither are provided
    /// built-in defaults are used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Adapter id sent with `initialize`.
    #[arg(long, default_value = "nova")]
    adapter_id: String,

    /// Send `attach` instead of `launch`.
    #[arg(long)]
    attach: bool,

    /// Launch (or attach) arguments as a JSON object.
    #[arg(long, value_name = "JSON", default_value = "{}")]
    launch: String,

    /// Breakpoint to set before the program starts. Repeatable.
    #[arg(long = "breakpoint", short = 'b', value_name = "FILE:LINE[:CONDITION]")]
    breakpoints: Vec<String>,

    /// Connect to an adapter already listening on this address.
    #[arg(long, conflicts_with = "adapter")]
    connect: Option<SocketAddr>,

    /// Adapter command line, e.g. `-- java-debug-adapter --stdio`.
    #[arg(trailing_var_arg = true, required_unless_present = "connect")]
    adapter: Vec<String>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.clone());
    nova_config::init_tracing(&config.logging);

    let configuration = parse_launch_arguments(&cli.launch)?;
    let kind = if cli.attach {
        LaunchKind::Attach
    } else {
        LaunchKind::Launch
    };
    let options = SessionOptions::from_config(&config.debug, cli.adapter_id.clone(), kind, configuration);
    let adapter_config = WireAdapterConfig {
        request_timeout: config.debug.request_timeout(),
        initialize_timeout: config.debug.initialize_timeout(),
    };

    let store = Arc::new(InMemoryBreakpointStore::new());
    for spec in &cli.breakpoints {
        let (path, line, attributes) = parse_breakpoint(spec)?;
        store.add(path, line, attributes);
    }
    let synchronizer = BreakpointSynchronizer::new(store.clone());
    let observer = synchronizer.observe();

    let session = DebugSession::new(options);
    synchronizer.add_session(&session).await;
    let printer = tokio::spawn(print_events(session.subscribe()));

    let connect = async {
        match cli.connect {
            Some(addr) => WireAdapter::connect_tcp(addr, adapter_config).await,
            None => {
                let (program, args) = cli
                    .adapter
                    .split_first()
                    .map(|(program, args)| (PathBuf::from(program), args.to_vec()))
                    .unwrap_or_default();
                let command = AdapterCommand {
                    program,
                    args,
                    ..AdapterCommand::default()
                };
                WireAdapter::spawn(&command, adapter_config)
            }
        }
    };
    let started = session.start(connect).await;

    if started.is_ok() {
        tokio::select! {
            _ = session.closed() => {}
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for Ctrl-C")?;
                eprintln!("nova-debug: stopping");
                session.stop(StopKind::UserStop).await;
            }
        }
    }

    synchronizer.shutdown();
    let outcomes = ShutdownCoordinator::from_config(&config.debug)
        .stop_all([session.clone()], StopKind::WorkspaceShutdown)
        .await
        .wait()
        .await;
    tracing::debug!(target: "nova.dap.client", ?outcomes, "shutdown complete");
    observer.abort();
    printer.abort();

    started.context("debug session failed")?;
    if let Some(code) = session.exit_code().filter(|code| *code != 0) {
        std::process::exit(i32::try_from(code).unwrap_or(1));
    }
    Ok(())
}

fn load_config(cli_path: Option<PathBuf>) -> nova_config::NovaConfig {
    let path = cli_path.or_else(|| std::env::var_os("NOVA_CONFIG").map(PathBuf::from));
    let Some(path) = path else {
        return nova_config::NovaConfig::default();
    };

    match nova_config::NovaConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "nova-debug: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            nova_config::NovaConfig::default()
        }
    }
}

fn parse_launch_arguments(text: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(text).context("--launch is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--launch must be a JSON object"),
    }
}

/// `FILE:LINE[:CONDITION]`. The first `:<digits>` segment is the line, so
/// drive letters and conditions containing `:` both work.
fn parse_breakpoint(spec: &str) -> anyhow::Result<(PathBuf, u32, BreakpointAttributes)> {
    for (idx, _) in spec.match_indices(':') {
        if idx == 0 {
            continue;
        }
        let rest = &spec[idx + 1..];
        let (line, condition) = match rest.split_once(':') {
            Some((line, condition)) => (line, Some(condition)),
            None => (rest, None),
        };
        let Ok(line) = line.parse::<u32>() else {
            continue;
        };
        anyhow::ensure!(line > 0, "breakpoint lines are 1-based: `{spec}`");

        let path = std::path::absolute(&spec[..idx])
            .with_context(|| format!("invalid breakpoint path in `{spec}`"))?;
        let attributes = BreakpointAttributes {
            condition: condition
                .filter(|c| !c.trim().is_empty())
                .map(str::to_string),
            ..BreakpointAttributes::default()
        };
        return Ok((path, line, attributes));
    }
    anyhow::bail!("invalid breakpoint `{spec}`; expected FILE:LINE[:CONDITION]")
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            SessionEvent::StateChanged(state) => eprintln!("nova-debug: {state:?}"),
            SessionEvent::Stopped {
                thread_id, reason, ..
            } => match thread_id {
                Some(thread) => eprintln!("nova-debug: stopped ({reason}) on thread {thread}"),
                None => eprintln!("nova-debug: stopped ({reason})"),
            },
            SessionEvent::Continued => eprintln!("nova-debug: continued"),
            SessionEvent::Process { name, pid } => match pid {
                Some(pid) => eprintln!("nova-debug: process {name} (pid {pid})"),
                None => eprintln!("nova-debug: process {name}"),
            },
            SessionEvent::ProcessTerminated => eprintln!("nova-debug: debuggee terminated"),
            SessionEvent::Exited { exit_code } => eprintln!("nova-debug: exited with code {exit_code}"),
            SessionEvent::Output { output, .. } => print!("{output}"),
            SessionEvent::ConnectionLost { reason } => eprintln!("nova-debug: connection lost: {reason}"),
        }
    }
}
