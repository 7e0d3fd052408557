use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stracefile::cli::Cli;
use stracefile::event::TraceFile;
use stracefile::resources::ResourceMonitor;
use stracefile::strace::Strace;
use stracefile::{ancestry, merge, metadata, parser};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let Some(command) = args.command else {
        anyhow::bail!("No command to trace. Usage: stracefile [OPTIONS] -- COMMAND [ARGS...]");
    };

    let log_file = tempfile::NamedTempFile::new().context("failed to create strace log file")?;

    // -f follow children, -T per-call durations, -ttt microsecond wall-clock
    // timestamps, -q suppress attach noise; the log grammar assumes exactly
    // this shape.
    let mut default_args: Vec<String> = ["-f", "-T", "-ttt", "-q", "-o"]
        .iter()
        .map(ToString::to_string)
        .collect();
    default_args.push(log_file.path().to_string_lossy().into_owned());

    let mut user_args = Vec::new();
    if let Some(expr) = &args.syscalls {
        user_args.push("-e".to_string());
        user_args.push(expr.clone());
    }
    user_args.extend(command);

    let strace = Strace {
        default_args,
        user_args,
        timeout: args.timeout.map(Duration::from_secs),
    };

    // The sampler runs for exactly as long as the traced command does and
    // keeps exclusive ownership of its samples until joined.
    let stop = Arc::new(AtomicBool::new(false));
    let sampler = match ResourceMonitor::new() {
        Ok(mut monitor) => {
            let stop = Arc::clone(&stop);
            Some(thread::spawn(move || {
                monitor.run(&stop);
                monitor
            }))
        }
        Err(err) => {
            eprintln!("[stracefile: cpu / memory usage will not be recorded: {err:#}]");
            None
        }
    };

    let timed_out = strace.run()?;
    stop.store(true, Ordering::Relaxed);
    if timed_out {
        eprintln!("[stracefile: timeout reached, writing partial trace]");
    }

    let resource_events = match sampler.map(|handle| handle.join()) {
        Some(Ok(monitor)) => monitor.into_events(),
        Some(Err(_)) => {
            eprintln!("[stracefile: resource sampler failed, continuing without it]");
            Vec::new()
        }
        None => Vec::new(),
    };

    let reader = BufReader::new(log_file.reopen().context("failed to reopen strace log")?);
    let mut events = parser::parse_log(reader)?;

    let owners = ancestry::resolve(&mut events);
    let metadata_events = metadata::synthesize(&mut events, &owners);

    let merged = merge::merge(vec![metadata_events, events, resource_events]);
    TraceFile {
        trace_events: merged,
    }
    .save(&args.output)?;

    println!("[+] Trace file saved to: {}", args.output.display());
    println!("[+] Analyze results: https://ui.perfetto.dev/");
    Ok(())
}
