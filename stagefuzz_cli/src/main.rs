use stagefuzz_core::config::HostConfig;
use stagefuzz_core::driver::{DriverError, Pipeline};
use stagefuzz_core::log::FacadeSink;
use stagefuzz_core::stats::{StatEntry, StatSnapshot, aggregate};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use env_logger::{Builder, Env, fmt};
use log::Level;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// More output: -v for debug, -vv for trace. RUST_LOG takes precedence.
    #[clap(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assemble the configured plugin pipeline and fuzz.
    Run {
        #[clap(short, long, value_parser)]
        config: PathBuf,
        /// Overrides `max-iterations` from the config.
        #[clap(short, long)]
        iterations: Option<u64>,
        /// Stop after one iteration.
        #[clap(short, long)]
        single_run: bool,
        /// Pin the fuzzer to this CPU core.
        #[clap(long)]
        bind_cpu: Option<usize>,
    },
    /// Print the records of one or more stat files.
    Stats {
        #[clap(required = true, value_parser)]
        files: Vec<PathBuf>,
        #[clap(long)]
        json: bool,
        /// Sum `total_` and average `avg_` tags across all files.
        #[clap(short, long)]
        aggregate: bool,
    },
}

fn init_logger(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = Env::default().filter_or("RUST_LOG", default_level);

    Builder::from_env(env)
        .format(|buf, record| {
            let mut style = buf.style();
            let prefix = match record.level() {
                Level::Error => {
                    style.set_color(fmt::Color::Red).set_bold(true);
                    "[X]"
                }
                Level::Warn => {
                    style.set_color(fmt::Color::Yellow).set_bold(true);
                    "[!]"
                }
                Level::Info => {
                    style.set_color(fmt::Color::Blue).set_bold(true);
                    "[*]"
                }
                Level::Debug => "[?]",
                Level::Trace => "[.]",
            };
            writeln!(buf, "{} {}", style.value(prefix), record.args())
        })
        .init();
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Command::Run {
            config,
            iterations,
            single_run,
            bind_cpu,
        } => {
            if let Some(id) = bind_cpu {
                bind_to_cpu(id)?;
            }
            run(&config, iterations, single_run)
        }
        Command::Stats {
            files,
            json,
            aggregate,
        } => print_stats(&files, json, aggregate),
    }
}

fn bind_to_cpu(id: usize) -> Result<(), anyhow::Error> {
    let cores = core_affinity::get_core_ids().context("Cannot list the CPU cores")?;
    let available = cores.len();
    let core = cores
        .into_iter()
        .find(|core| core.id == id)
        .with_context(|| format!("Tried to bind to core {id} but only {available} are available"))?;
    if !core_affinity::set_for_current(core) {
        anyhow::bail!("Failed to bind to core {id}");
    }
    log::info!("Bound to core {id}");
    Ok(())
}

fn run(config_path: &Path, iterations: Option<u64>, single_run: bool) -> Result<(), anyhow::Error> {
    log::info!("Loading configuration from {config_path:?}");
    let mut config = HostConfig::load_from_file(config_path)?;
    if let Some(iterations) = iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    if single_run {
        config.fuzzer.max_iterations = Some(1);
    }
    config.validate()?;
    log::debug!("Effective configuration: {config:#?}");

    let mut pipeline = config.build_pipeline(FacadeSink)?;
    let shutdown = pipeline.shutdown_handle();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, std::sync::Arc::clone(&shutdown))?;
    }

    pipeline.setup()?;
    log::info!(
        "Fuzzing with stats at {:?}{}",
        config.stats_path(),
        match config.fuzzer.max_iterations {
            Some(limit) => format!(" for {limit} iteration(s)"),
            None => String::new(),
        }
    );

    let start_time = Instant::now();
    let result = pipeline.run(config.fuzzer.max_iterations);
    if shutdown.load(Ordering::SeqCst) {
        log::info!("Interrupted, tearing down");
    }
    finish(&mut pipeline, start_time);

    let summary = match result {
        Ok(summary) => summary,
        Err(DriverError::Aborted {
            iteration,
            plugin,
            error,
        }) => anyhow::bail!("Aborted in iteration {iteration}, '{plugin}' failed: {error:#}"),
        Err(e) => return Err(e.into()),
    };
    log::info!(
        "{} iteration(s), {} failed",
        summary.iterations,
        summary.failures
    );
    Ok(())
}

fn finish(pipeline: &mut Pipeline, start_time: Instant) {
    let executions = pipeline.iterations();
    let elapsed = start_time.elapsed();
    let secs = elapsed.as_secs_f32();
    let exec_per_sec = if secs > 0.0 {
        executions as f32 / secs
    } else {
        0.0
    };
    log::info!("Fuzz loop finished in {elapsed:.2?} ({exec_per_sec:.1} exec/s)");

    let report = pipeline.teardown();
    for (plugin, error) in &report.failures {
        log::error!("Plugin '{plugin}' failed to clean up: {error:#}");
    }
}

fn print_stats(files: &[PathBuf], json: bool, combine: bool) -> Result<(), anyhow::Error> {
    let mut snapshots = Vec::with_capacity(files.len());
    for file in files {
        let snapshot = StatSnapshot::open(file)
            .map_err(|e| anyhow::anyhow!("Failed to read stat file {:?}: {}", file, e))?;
        snapshots.push(snapshot);
    }

    if combine {
        let entries = aggregate(&snapshots);
        if json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        } else {
            print_entries(&entries);
        }
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }
    for (file, snapshot) in files.iter().zip(&snapshots) {
        println!(
            "{} (pid {}, {:?})",
            file.display(),
            snapshot.header.pid,
            snapshot.state
        );
        print_entries(&snapshot.entries);
    }
    Ok(())
}

fn print_entries(entries: &[StatEntry]) {
    for entry in entries {
        println!("  {entry}");
    }
}
