//! `dcnum-run` — a deformability-cytometry pipeline runner.
//!
//! Usage:
//!   dcnum-run run <input> [--out <path>] [--overwrite] [--segmenter <code:args>]
//!       [--background <code:args>] [--feature <code:args>] [--gate <code:args>]
//!       [--basin-strategy tap|drain] [--num-workers N] [--debug]
//!   dcnum-run ppid <input> [--segmenter ...] [--background ...] [--feature ...] [--gate ...]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use dcnum::config::{BasinStrategy, PipelineCodes, PipelineConfig, RuntimeConfig};
use dcnum::data::input::{InputData, RawStreamInputData};
use dcnum::logic::JobRunner;
use dcnum::meta::PipelineId;

#[derive(Parser)]
#[command(name = "dcnum-run", about = "Deformability-cytometry pipeline runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Hidden worker-process entry point: attach to the named shared memory
    /// region instead of parsing a job. Not a user-facing subcommand, used
    /// only by `spawn_process`, which invokes this binary with no other
    /// subcommand present.
    #[arg(long, hide = true, global = true)]
    worker_slave: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline on an input stream.
    Run {
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
        #[arg(long, default_value = "legacy")]
        segmenter: String,
        #[arg(long, default_value = "sparsemed")]
        background: String,
        #[arg(long, default_value = "legacy")]
        feature: String,
        #[arg(long, default_value = "norm")]
        gate: String,
        #[arg(long, default_value = "tap")]
        basin_strategy: String,
        #[arg(long)]
        num_workers: Option<usize>,
        #[arg(long)]
        debug: bool,
    },
    /// Print the resolved pipeline identifier without running anything.
    Ppid {
        input: PathBuf,
        #[arg(long, default_value = "legacy")]
        segmenter: String,
        #[arg(long, default_value = "sparsemed")]
        background: String,
        #[arg(long, default_value = "legacy")]
        feature: String,
        #[arg(long, default_value = "norm")]
        gate: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Some(path) = cli.worker_slave {
        // A child process spawned by `spawn_process`: in this reference
        // runtime every worker is launched via `spawn_thread` inside the
        // orchestrating process, so a slave invocation has nothing to attach
        // to yet and exits cleanly. Kept as a real subcommand so the
        // argument-parsing contract matches what `spawn_process` invokes.
        eprintln!("worker-slave mode: attach target {}", path.display());
        std::process::exit(0);
    }

    let command = match cli.command {
        Some(c) => c,
        None => {
            eprintln!("a subcommand is required: run, ppid");
            std::process::exit(2);
        }
    };

    let code = match command {
        Command::Run {
            input,
            out,
            overwrite,
            segmenter,
            background,
            feature,
            gate,
            basin_strategy,
            num_workers,
            debug,
        } => {
            run_pipeline(
                input,
                out,
                overwrite,
                segmenter,
                background,
                feature,
                gate,
                basin_strategy,
                num_workers,
                debug,
            )
            .await
        }
        Command::Ppid {
            input,
            segmenter,
            background,
            feature,
            gate,
        } => run_ppid(input, segmenter, background, feature, gate),
    };
    std::process::exit(code);
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    input: PathBuf,
    out: Option<PathBuf>,
    overwrite: bool,
    segmenter: String,
    background: String,
    feature: String,
    gate: String,
    basin_strategy: String,
    num_workers: Option<usize>,
    debug: bool,
) -> i32 {
    if !input.exists() {
        eprintln!("input not found: {}", input.display());
        return 3;
    }
    let basin_strategy = match basin_strategy.as_str() {
        "tap" => BasinStrategy::Tap,
        "drain" => BasinStrategy::Drain,
        other => {
            eprintln!("invalid --basin-strategy '{other}', expected tap|drain");
            return 2;
        }
    };

    let config = PipelineConfig {
        input: input.clone(),
        output: out,
        overwrite,
        runtime: RuntimeConfig::default().with_num_workers(num_workers),
        pipeline: PipelineCodes {
            background,
            segmenter,
            feature,
            gate,
        },
        basin_strategy,
        debug,
    };

    let output_path = config.output_path();
    if output_path.exists() && !overwrite {
        eprintln!("output path {} already exists (use --overwrite)", output_path.display());
        return 4;
    }

    let loaded = match RawStreamInputData::open(&input) {
        Ok(r) => Arc::new(r) as Arc<dyn InputData>,
        Err(e) => {
            error!(error = %e, "failed to open input");
            return 3;
        }
    };

    let runner = JobRunner::new(config, loaded);
    match tokio::select! {
        res = async { runner.run().await } => res,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            std::process::exit(130);
        }
    } {
        Ok(report) => {
            println!(
                "run_id={} events={} frames={} yield={:.4} masks_dropped={}",
                report.run_id,
                report.event_count,
                report.num_frames,
                report.yield_fraction(),
                report.masks_dropped
            );
            0
        }
        Err(e) => {
            error!(error = %e, "pipeline run failed");
            5
        }
    }
}

fn run_ppid(input: PathBuf, segmenter: String, background: String, feature: String, gate: String) -> i32 {
    if !input.exists() {
        eprintln!("input not found: {}", input.display());
        return 3;
    }
    let pid = PipelineId {
        generation: "1".to_string(),
        data: "raw:fmt=dcnumrw1".to_string(),
        background,
        segmenter,
        feature,
        gate,
    };
    println!("{}", pid.joined());
    println!("hash={}", pid.hash());
    println!("run_id={}", pid.run_id());
    0
}
