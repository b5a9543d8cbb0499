//! Command-line runner for TxScript CAN-bus test scripts.
//!
//! Scripts run against an in-memory virtual bus, optionally fed with a
//! recorded candump trace.
//!
//! # Usage
//!
//! ```bash
//! # Report every lexer and parser diagnostic
//! txscript check tests/obd_request.txs
//!
//! # Run on two ports and print the frames that were sent
//! txscript run tests/obd_request.txs -p can0 -p can1 --frames
//!
//! # Feed a recorded trace to the script's handlers for ten seconds
//! txscript run responder.txs --replay drive.log --duration 10000
//!
//! # Turn a trace into a script that re-sends it
//! txscript convert drive.log --stdout
//! ```

mod converter;
mod error;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use txscript_core::bus::VirtualBus;
use txscript_core::config::{txscript_dir, TxScriptConfig};
use txscript_core::log::ExecutorEvent;
use txscript_core::parser::parse_source;
use txscript_core::trace::{parse_trace, replay};
use txscript_core::ScriptExecutor;

use crate::converter::TraceConverter;
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "txscript", about = "Check, run and generate TxScript CAN-bus test scripts")]
#[command(version)]
struct Cli {
    /// Also write logs to this file
    #[arg(long, global = true, env = "TXSCRIPT_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Lex and parse a script, printing every diagnostic
    Check {
        /// Path to the script (reads stdin if omitted)
        script: Option<PathBuf>,
    },
    /// Run a script against the virtual CAN bus
    Run {
        /// Path to the script (reads stdin if omitted)
        script: Option<PathBuf>,
        /// Target port; repeat for several (defaults to the configured ports, then can0)
        #[arg(short = 'p', long = "port")]
        ports: Vec<String>,
        /// candump trace to inject while the script runs
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Deliver replayed frames on this port instead of the recorded one
        #[arg(long)]
        replay_port: Option<String>,
        /// Deliver every sent frame back to the script's own handlers
        #[arg(long)]
        loopback: bool,
        /// Stop after this many milliseconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Append errors to this file as JSON Lines
        #[arg(long)]
        error_log: Option<PathBuf>,
        /// Print the frames written to the bus after the run
        #[arg(long)]
        frames: bool,
        /// Output format for script output and errors
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Convert a candump trace to a script that re-sends it
    Convert {
        /// Path to the trace (reads stdin if omitted)
        trace: Option<PathBuf>,
        /// Name for the output script file
        #[arg(short, long)]
        name: Option<String>,
        /// Print to stdout instead of saving to file
        #[arg(long)]
        stdout: bool,
    },
}

struct RunOptions {
    ports: Vec<String>,
    replay: Option<PathBuf>,
    replay_port: Option<String>,
    loopback: bool,
    duration: Option<u64>,
    error_log: Option<PathBuf>,
    frames: bool,
    format: OutputFormat,
}

fn scripts_dir() -> PathBuf {
    let dir = txscript_dir().join("scripts");
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if log_file.is_some() { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path.file_name().unwrap_or_else(|| OsStr::new("txscript.log"));
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr_layer).init();
            None
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let guard = init_tracing(cli.log_file.as_deref());

    let result = match cli.command {
        Command::Check { script } => check_script(script),
        Command::Run { script, ports, replay, replay_port, loopback, duration, error_log, frames, format } => {
            let options = RunOptions { ports, replay, replay_port, loopback, duration, error_log, frames, format };
            run_script(script, options).await
        }
        Command::Convert { trace, name, stdout } => convert_trace(trace, name, stdout),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        drop(guard);
        process::exit(e.exit_code());
    }
}

fn read_source(path: Option<&Path>) -> Result<String, CliError> {
    match path {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn check_script(script: Option<PathBuf>) -> Result<(), CliError> {
    let source = read_source(script.as_deref())?;
    let (program, errors) = parse_source(&source);

    for error in &errors {
        eprintln!("{}", error);
    }
    if !errors.is_empty() {
        return Err(CliError::Script { count: errors.len() });
    }

    println!(
        "OK: {} statement(s), {} function(s), {} receive handler(s), {} interval handler(s)",
        program.statements.len(),
        program.functions.len(),
        program.receive_handlers.len(),
        program.interval_handlers.len()
    );
    Ok(())
}

fn print_event(event: &ExecutorEvent, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string(event) {
                println!("{}", json);
            }
        }
        OutputFormat::Text => match event {
            ExecutorEvent::Output { text, .. } => println!("{}", text),
            ExecutorEvent::Error { error, .. } => eprintln!("{}", error),
            ExecutorEvent::StateChanged { .. } => {}
        },
    }
}

async fn run_script(script: Option<PathBuf>, options: RunOptions) -> Result<(), CliError> {
    let source = read_source(script.as_deref())?;
    let config = TxScriptConfig::load();

    let ports = if !options.ports.is_empty() {
        options.ports
    } else if !config.default_ports.is_empty() {
        config.default_ports.clone()
    } else {
        vec!["can0".to_string()]
    };

    let trace = match options.replay {
        Some(ref path) => Some(parse_trace(&std::fs::read_to_string(path)?)?),
        None => None,
    };

    let bus = Arc::new(VirtualBus::with_capacity(config.executor.frame_buffer.max(1)));
    bus.set_loopback(options.loopback);
    let executor = ScriptExecutor::with_config(bus.clone(), config.executor.clone());
    if let Some(ref path) = options.error_log {
        executor.persist_errors(path).await?;
    }

    let mut events = executor.subscribe();
    let format = options.format;
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event, format),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "output events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let run_id = executor.start(&source, &ports).await;
    let outcome = match run_id {
        Ok(run_id) => {
            info!(run_id = %run_id, ports = ?ports, "script started");
            let replayer = trace.map(|frames| {
                let bus = bus.clone();
                let port = options.replay_port.clone();
                let cancel = CancellationToken::new();
                let task_cancel = cancel.clone();
                let handle = tokio::spawn(async move { replay(&bus, &frames, port.as_deref(), &task_cancel).await });
                (handle, cancel)
            });

            let limit = options.duration.map(Duration::from_millis);
            tokio::select! {
                state = executor.wait_until_settled() => info!(state = %state, "script settled"),
                _ = sleep_or_forever(limit) => info!("duration elapsed"),
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }

            if let Some((handle, cancel)) = replayer {
                cancel.cancel();
                if let Ok(replayed) = handle.await {
                    info!(replayed, "trace replay finished");
                }
            }
            executor.stop().await?;

            let count = executor.error_count().await;
            if count > 0 {
                Err(CliError::Runtime { count })
            } else {
                Ok(())
            }
        }
        Err(e) => Err(CliError::from(e)),
    };

    drop(executor);
    let _ = printer.await;

    if options.frames {
        for frame in bus.sent() {
            println!("{}", frame);
        }
    }
    outcome
}

async fn sleep_or_forever(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn convert_trace(trace_path: Option<PathBuf>, name: Option<String>, to_stdout: bool) -> Result<(), CliError> {
    let script_text = match trace_path {
        Some(ref path) => TraceConverter::convert_file(path)?,
        None => TraceConverter::convert_stdin()?,
    };

    if to_stdout {
        print!("{}", script_text);
    } else {
        let script_name = name.unwrap_or_else(|| {
            trace_path
                .as_ref()
                .and_then(|p| p.file_stem())
                .and_then(|s| s.to_str())
                .unwrap_or("converted")
                .to_string()
        });
        let output_path = scripts_dir().join(format!("{}.txs", script_name));
        std::fs::write(&output_path, &script_text)?;
        eprintln!("Saved to {}", output_path.display());
    }

    Ok(())
}
