use criterion::{criterion_group, criterion_main, Criterion};
use kmeans_allreduce::{
    generate_sparse_rows, Communicator, InMemorySource, Result, SingleProcess, SparseRowBuf,
    ThreadGroup, TrainConfig, TrainOutcome, Trainer,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn train_single(rows: &[SparseRowBuf], config: &TrainConfig) -> Result<TrainOutcome> {
    let mut source = InMemorySource::new(rows, config.block_size)?;
    Trainer::new(config.clone())?.run(&mut source, &SingleProcess::new())
}

fn train_four_ranks(rows: &[SparseRowBuf], config: &TrainConfig) -> Result<TrainOutcome> {
    let mut outcomes = ThreadGroup::run(4, |comm| {
        let mut source =
            InMemorySource::shard(rows, comm.rank(), comm.world_size(), config.block_size)?;
        Trainer::new(config.clone())?.run(&mut source, &comm)
    })?;
    Ok(outcomes.swap_remove(0))
}

/// First seed from 42 upwards whose sampled centroids keep every cluster
/// populated, so the timed runs below always complete.
fn populated_seed(
    rows: &[SparseRowBuf],
    config: &TrainConfig,
    train: fn(&[SparseRowBuf], &TrainConfig) -> Result<TrainOutcome>,
) -> TrainConfig {
    (42..142)
        .map(|seed| TrainConfig {
            seed,
            ..config.clone()
        })
        .find(|candidate| train(rows, candidate).is_ok())
        .expect("no seed in 42..142 keeps every cluster populated")
}

fn bench_kmeans(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let rows = generate_sparse_rows(20_000, 512, 16, &mut rng);
    let config = TrainConfig {
        k: 8,
        max_iter: 10,
        seed: 42,
        block_size: 1024,
    };

    let single = populated_seed(&rows, &config, train_single);
    c.bench_function("kmeans_single_rank_20k_512f", |b| {
        b.iter(|| {
            let _run = train_single(&rows, &single).expect("single rank bench run");
        });
    });

    let four = populated_seed(&rows, &config, train_four_ranks);
    c.bench_function("kmeans_four_ranks_20k_512f", |b| {
        b.iter(|| {
            let _run = train_four_ranks(&rows, &four).expect("four rank bench run");
        });
    });
}

criterion_group!(benches, bench_kmeans);
criterion_main!(benches);
