use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::Parser;
use rayon::ThreadPoolBuilder;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use kmeans_allreduce::{
    agree, Communicator, KMeansError, LibSvmSource, Result as KMeansResult, SingleProcess, ThreadGroup,
    TrainConfig, TrainOutcome, Trainer,
};

#[derive(Parser, Debug)]
#[command(name = "kmeans-allreduce")]
#[command(about = "Distributed k-means over sparse libsvm shards", long_about = None)]
struct Args {
    /// Sparse dataset in libsvm format (`[label] index:weight ...` per line)
    data: PathBuf,

    /// Number of clusters
    k: usize,

    /// Number of iterations (no early stopping)
    max_iter: usize,

    /// Number of ranks to launch, one thread each
    #[arg(long, default_value_t = 1)]
    world_size: usize,

    /// Seed for the root's initial row sampling
    #[arg(long, default_value_t = 0u64)]
    seed: u64,

    /// Rows per block when iterating a shard
    #[arg(long, default_value_t = 4096)]
    block_size: usize,

    /// Override Rayon global thread pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Optional JSON file receiving per-iteration cluster sizes
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Verbosity: set RUST_LOG style level (info, debug, warn)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(args) {
        error!(error = %err, "kmeans run failed");
        process::exit(err.exit_code());
    }
}

fn init_logging(level: &str) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(match level {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|err| err.to_string())
}

fn run(args: Args) -> KMeansResult<()> {
    let config = TrainConfig {
        k: args.k,
        max_iter: args.max_iter,
        seed: args.seed,
        block_size: args.block_size,
    };
    config.validate()?;

    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|err| {
                KMeansError::InvalidConfig(format!("failed to configure rayon threadpool: {err}"))
            })?;
        info!(threads, "configured rayon global thread pool");
    }

    info!(
        data = ?args.data,
        k = config.k,
        max_iter = config.max_iter,
        world_size = args.world_size,
        seed = config.seed,
        "starting distributed kmeans"
    );

    let start = Instant::now();
    let outcome = if args.world_size == 1 {
        train_rank(&args.data, &config, SingleProcess::new())?
    } else {
        let mut per_rank = ThreadGroup::run(args.world_size, |comm| {
            train_rank(&args.data, &config, comm)
        })?;
        // every rank holds the same model; keep the root's
        per_rank.swap_remove(0)
    };
    let elapsed = start.elapsed();

    let final_sizes = outcome
        .history
        .last()
        .map(|stats| stats.cluster_sizes.clone())
        .unwrap_or_default();
    info!(
        dim = outcome.centroids.ncols(),
        iterations = outcome.history.len(),
        took_seconds = elapsed.as_secs_f64(),
        "kmeans finished"
    );
    info!(?final_sizes, "cluster population counts");

    if let Some(path) = args.summary.as_ref() {
        write_summary(path, &args, &config, &outcome, elapsed.as_secs_f64())?;
    }
    Ok(())
}

fn train_rank<C: Communicator>(data: &Path, config: &TrainConfig, comm: C) -> KMeansResult<TrainOutcome> {
    let opened = LibSvmSource::open(data, comm.rank(), comm.world_size(), config.block_size);
    let mut source = agree(&comm, opened)?;
    let outcome = Trainer::new(config.clone())?.run(&mut source, &comm)?;
    comm.finalize()?;
    Ok(outcome)
}

fn write_summary(
    path: &Path,
    args: &Args,
    config: &TrainConfig,
    outcome: &TrainOutcome,
    elapsed_secs: f64,
) -> KMeansResult<()> {
    let dump = json!({
        "data": args.data.display().to_string(),
        "world_size": args.world_size,
        "k": config.k,
        "dim": outcome.centroids.ncols(),
        "max_iter": config.max_iter,
        "seed": config.seed,
        "block_size": config.block_size,
        "elapsed_seconds": elapsed_secs,
        "iterations": outcome.history,
    });
    std::fs::write(path, serde_json::to_string_pretty(&dump)?)?;
    info!(path = ?path, "wrote run summary");
    Ok(())
}
