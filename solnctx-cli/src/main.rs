//! CLI for the solnctx solution execution context.
//!
//! Provides commands for running a synthetic stencil workload through the
//! full context lifecycle, reconciling raw timer readings, and producing
//! settings files.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use rayon::prelude::*;
use solnctx::env::{Environment, LocalCluster};
use solnctx::stats::{RawTimes, allot, num_str, reconcile};
use solnctx::{DimKind, Dims, Grid, Settings, SolutionContext, StepCost, WorkPack};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// solnctx: Solution execution context for distributed stencil solvers.
#[derive(Parser)]
#[command(name = "solnctx", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Prepare a solution, run synthetic steps, and print the stats report.
    Run {
        /// Settings file written by `solnctx settings`.
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Context options, e.g. "-d 64 -bx 16 -block_threads 2".
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        options: String,

        /// Number of steps to run.
        #[arg(long, default_value = "10")]
        steps: u64,

        /// Number of in-process ranks, split along the first domain dimension.
        #[arg(long, default_value = "1")]
        ranks: usize,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Reconcile raw timer readings (in seconds) into a time breakdown.
    Reconcile {
        /// Whole run time.
        #[arg(long)]
        run: f64,

        /// Halo exchange time.
        #[arg(long, default_value = "0")]
        halo: f64,

        /// Halo wait time.
        #[arg(long, default_value = "0")]
        wait: f64,

        /// Rank-exterior compute time.
        #[arg(long, default_value = "0")]
        exterior: f64,

        /// Rank-interior compute time.
        #[arg(long, default_value = "0")]
        interior: f64,

        /// Message polling time sampled on one region thread.
        #[arg(long, default_value = "0")]
        test: f64,

        /// Region thread count.
        #[arg(long, default_value = "1")]
        region_threads: usize,

        /// Per-pack compute times in registration order, comma separated.
        #[arg(long, value_delimiter = ',')]
        packs: Vec<f64>,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the settings produced by an option string as JSON.
    Settings {
        /// Context options, e.g. "-d 64 -bx 16".
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        options: String,
    },
}

/// Output format for reports.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text.
    Text,
    /// JSON object.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            settings,
            options,
            steps,
            ranks,
            format,
        } => cmd_run(settings.as_deref(), &options, steps, ranks, format),
        Commands::Reconcile {
            run,
            halo,
            wait,
            exterior,
            interior,
            test,
            region_threads,
            packs,
            format,
        } => {
            let raw = RawTimes {
                run,
                halo,
                wait,
                exterior,
                interior,
                test,
            };
            cmd_reconcile(&raw, region_threads, &packs, format)
        }
        Commands::Settings { options } => cmd_settings(&options),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn default_dims() -> Dims {
    Dims::new("t", ["x", "y", "z"])
}

fn load_settings(path: Option<&Path>) -> CliResult<Settings> {
    match path {
        Some(path) => Ok(Settings::from_json(&std::fs::read_to_string(path)?)?),
        None => Ok(Settings::new(default_dims())),
    }
}

/// Implements `solnctx run`.
fn cmd_run(
    settings_path: Option<&Path>,
    options: &str,
    steps: u64,
    ranks: usize,
    format: OutputFormat,
) -> CliResult<()> {
    let settings = load_settings(settings_path)?;

    let output = if ranks <= 1 {
        run_rank(settings, options, steps, None)?
    } else {
        let handles: Vec<_> = LocalCluster::ranks(ranks)
            .into_iter()
            .map(|env| {
                let settings = settings.clone();
                let options = options.to_string();
                thread::spawn(move || run_rank(settings, &options, steps, Some(env)))
            })
            .collect();
        let mut outputs = Vec::with_capacity(ranks);
        for handle in handles {
            let output = handle.join().map_err(|_| "rank thread panicked")??;
            outputs.push(output);
        }
        outputs.into_iter().next().ok_or("no ranks ran")?
    };

    match format {
        OutputFormat::Text => {
            println!("{}", output.summary);
            print!("{}", output.report);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output.json)?),
    }
    Ok(())
}

/// What rank 0 prints.
struct RankOutput {
    summary: String,
    report: String,
    json: serde_json::Value,
}

/// Runs one rank through configure, prepare, steps, report, and end.
fn run_rank(
    settings: Settings,
    options: &str,
    steps: u64,
    env: Option<LocalCluster>,
) -> CliResult<RankOutput> {
    let mut ctx = SolutionContext::from_settings("synthetic", settings);

    let mut options = options.to_string();
    if let Some(env) = env {
        let split = ctx
            .settings()
            .dims
            .domain_dims()
            .next()
            .ok_or("no domain dimension to split over ranks")?
            .to_string();
        options.push_str(&format!(" -nr{split} {} -ri{split} {}", env.num_ranks(), env.rank_index()));
        ctx = ctx.with_environment(env);
    }
    let rest = ctx.apply_command_line_options(&options)?;
    if !rest.is_empty() {
        warn!(unused = %rest, "ignoring unrecognized options");
    }

    let grid_dims: Vec<String> = ctx
        .settings()
        .dims
        .of_kinds(&[DimKind::Step, DimKind::Domain])
        .map(str::to_string)
        .collect();
    let pressure = ctx.add_grid(Grid::new("pressure", grid_dims.iter().map(String::as_str)), true)?;
    ctx.add_pack(WorkPack::new("smooth", StepCost { reads: 1, writes: 1, fpops: 2 }));
    ctx.add_pack(WorkPack::new("energy", StepCost { reads: 1, writes: 0, fpops: 2 }));

    ctx.prepare()?;
    pressure.write(|data| data.fill(1.0));

    let mut energy = 0.0;
    for _ in 0..steps {
        energy = run_step(&mut ctx, &pressure)?;
    }
    info!(steps, energy, "synthetic run finished");

    let counts = ctx.thread_counts();
    let totals = ctx.totals();
    let report = ctx.report();
    let summary = format!(
        "Context '{}': {} rank(s), threads total={} region={} block={}, {} bytes on rank, {} bytes in total",
        ctx.name(),
        ctx.env().num_ranks(),
        counts.total,
        counts.region,
        counts.block,
        num_str(as_f64(totals.rank_bytes)),
        num_str(as_f64(totals.total_bytes)),
    );
    let json = serde_json::json!({
        "context": ctx.name(),
        "threads": counts,
        "totals": totals,
        "report": &report,
    });
    ctx.end()?;

    Ok(RankOutput {
        summary,
        report: report.to_string(),
        json,
    })
}

/// One synthetic step: a halo barrier, a reduction on the region threads,
/// and a smoothing pass on the block threads. Returns the reduction.
fn run_step(ctx: &mut SolutionContext, pressure: &Grid) -> CliResult<f64> {
    ctx.timers_mut().run.start();

    ctx.timers_mut().halo.start();
    ctx.timers_mut().wait.start();
    ctx.env().global_barrier();
    ctx.timers_mut().wait.stop();
    ctx.timers_mut().halo.stop();

    let started = Instant::now();
    let energy = {
        let threads = ctx.threads().ok_or("solution not prepared")?;
        let len = i64::try_from(pressure.num_elements())?;
        let chunk = (len / i64::try_from(threads.counts().region)?).max(1);
        let total = Mutex::new(0.0);
        pressure.read(|data| {
            threads.parallel_for(0, len, chunk, |start, stop, _| {
                let range = usize::try_from(start).unwrap_or(0)..usize::try_from(stop).unwrap_or(0);
                let partial: f64 = data[range].iter().map(|v| v * v).sum();
                *total.lock() += partial;
            });
        });
        total.into_inner()
    };
    let exterior = started.elapsed();

    let started = Instant::now();
    {
        let threads = ctx.threads().ok_or("solution not prepared")?;
        let pool = threads.block_pool(0).ok_or("no block pool")?;
        pressure.write(|data| {
            pool.install(|| data.par_iter_mut().for_each(|v| *v = 0.5 * *v + 0.5));
        });
    }
    let interior = started.elapsed();

    let timers = ctx.timers_mut();
    timers.exterior.add(exterior);
    timers.interior.add(interior);
    for (index, elapsed) in [(0, interior), (1, exterior)] {
        if let Some(pack) = ctx.pack_mut(index) {
            pack.timer.add(elapsed);
            pack.add_steps(1);
        }
    }
    ctx.record_steps(1);
    ctx.timers_mut().run.stop();
    Ok(energy)
}

#[allow(clippy::cast_precision_loss)] // byte counts for display only
fn as_f64(n: u64) -> f64 {
    n as f64
}

/// Implements `solnctx reconcile`.
fn cmd_reconcile(raw: &RawTimes, region_threads: usize, packs: &[f64], format: OutputFormat) -> CliResult<()> {
    let times = reconcile(raw, region_threads);
    let (shares, other_compute) = allot(times.compute, packs.iter().copied());

    match format {
        OutputFormat::Text => {
            println!("run (sec):             {}", num_str(times.run));
            println!("  compute (sec):       {}", num_str(times.compute));
            println!("    exterior (sec):    {}", num_str(times.exterior));
            println!("    interior (sec):    {}", num_str(times.interior));
            println!("  halo (sec):          {}", num_str(times.halo));
            println!("    exchange (sec):    {}", num_str(times.halo_exchange));
            println!("    waits (sec):       {}", num_str(times.wait));
            println!("    tests (sec):       {}", num_str(times.test));
            println!("  other (sec):         {}", num_str(times.other));
            for (i, share) in shares.iter().enumerate() {
                println!("pack {i} (sec):          {}", num_str(*share));
            }
            if !shares.is_empty() {
                println!("other compute (sec):   {}", num_str(other_compute));
            }
        }
        OutputFormat::Json => {
            let json = serde_json::json!({
                "times": times,
                "packs": shares,
                "other_compute": other_compute,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(())
}

/// Implements `solnctx settings`.
fn cmd_settings(options: &str) -> CliResult<()> {
    let mut ctx = SolutionContext::new("settings", default_dims());
    let rest = ctx.apply_command_line_options(options)?;
    if !rest.is_empty() {
        warn!(unused = %rest, "ignoring unrecognized options");
    }
    println!("{}", ctx.settings().to_json()?);
    Ok(())
}
