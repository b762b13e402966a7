use std::io::Write;

use kmeans_allreduce::{
    global_combine, local_accumulate, Accumulator, CentroidModel, Communicator, InMemorySource,
    KMeansError, LibSvmSource, SingleProcess, SparseDataSource, SparseRowBuf, ThreadGroup,
    TrainConfig, TrainOutcome, Trainer,
};
use ndarray::{array, Array2};
use proptest::prelude::*;

fn grid_rows() -> Vec<SparseRowBuf> {
    // integer weights keep every sum exact regardless of grouping
    (0..24u32)
        .map(|i| SparseRowBuf::from_pairs(&[(i % 5, (i % 3 + 1) as f32), (5 + i % 4, 2.0)]))
        .collect()
}

fn train_sharded(rows: &[SparseRowBuf], world_size: usize, config: &TrainConfig) -> Vec<TrainOutcome> {
    ThreadGroup::run(world_size, |comm| {
        let mut source =
            InMemorySource::shard(rows, comm.rank(), comm.world_size(), config.block_size)?;
        let outcome = Trainer::new(config.clone())?.run(&mut source, &comm)?;
        comm.finalize()?;
        Ok(outcome)
    })
    .expect("distributed training succeeds")
}

#[test]
fn centroids_are_identical_on_every_rank_after_initialization() {
    let rows = grid_rows();
    let config = TrainConfig {
        k: 4,
        max_iter: 1,
        seed: 8,
        block_size: 5,
    };
    let seeded = ThreadGroup::run(3, |comm| {
        let mut source =
            InMemorySource::shard(&rows, comm.rank(), comm.world_size(), config.block_size)?;
        let mut trainer = Trainer::new(config.clone())?;
        trainer.prepare(&mut source, &comm)?;
        Ok(trainer.model().map(|m| m.centroids().clone()))
    })
    .unwrap();
    let first = seeded[0].clone().expect("model prepared");
    assert_eq!(first.dim(), (4, 9));
    for centroids in &seeded {
        assert_eq!(centroids.as_ref(), Some(&first));
    }
}

#[test]
fn counts_cover_every_row_each_iteration() {
    let rows = grid_rows();
    let config = TrainConfig {
        k: 1,
        max_iter: 4,
        seed: 2,
        block_size: 4,
    };
    for outcome in train_sharded(&rows, 3, &config) {
        assert_eq!(outcome.history.len(), 4);
        for stats in &outcome.history {
            assert_eq!(stats.total_rows, rows.len() as u64);
            assert_eq!(stats.cluster_sizes.iter().sum::<u64>(), stats.total_rows);
        }
        let local: usize = outcome.history[0].local_rows;
        assert_eq!(local, 8);
    }
}

#[test]
fn single_cluster_matches_global_mean_across_shards() {
    let rows = grid_rows();
    let config = TrainConfig {
        k: 1,
        max_iter: 1,
        seed: 4,
        block_size: 3,
    };
    let mut expected = Array2::<f64>::zeros((1, 9));
    for row in &rows {
        for (idx, value) in row.as_row().iter() {
            expected[(0, idx)] += value;
        }
    }
    expected /= rows.len() as f64;

    for outcome in train_sharded(&rows, 2, &config) {
        assert_eq!(outcome.centroids, expected);
    }
}

#[test]
fn repeated_runs_produce_identical_centroid_sequences() {
    let rows = grid_rows();
    let config = TrainConfig {
        k: 2,
        max_iter: 5,
        seed: 13,
        block_size: 4,
    };
    let record = || {
        ThreadGroup::run(2, |comm| {
            let mut source =
                InMemorySource::shard(&rows, comm.rank(), comm.world_size(), config.block_size)?;
            let mut trainer = Trainer::new(config.clone())?;
            trainer.prepare(&mut source, &comm)?;
            let mut sequence = Vec::new();
            for _ in 0..config.max_iter {
                trainer.step(&mut source, &comm)?;
                sequence.push(trainer.model().map(|m| m.centroids().clone()));
            }
            Ok(sequence)
        })
        .map_err(|err| err.to_string())
    };
    let first = record();
    assert_eq!(first, record());
    if let Ok(per_rank) = &first {
        assert_eq!(per_rank[0], per_rank[1]);
    }
}

#[test]
fn sharded_accumulator_matches_single_process() {
    let rows = grid_rows();
    let centroids = array![
        [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        [0.0, 1.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 1.0],
    ];
    let model = CentroidModel::from_centroids(centroids);

    let mut whole = InMemorySource::new(&rows, 7).unwrap();
    whole.set_feature_dimension(9).unwrap();
    let single = local_accumulate(&mut whole, model.centroids()).unwrap();
    let single = global_combine(single.accumulator, &SingleProcess::new()).unwrap();

    let reduced = ThreadGroup::run(2, |comm| {
        let mut shard = InMemorySource::shard(&rows, comm.rank(), comm.world_size(), 5)?;
        shard.set_feature_dimension(9)?;
        let pass = local_accumulate(&mut shard, model.centroids())?;
        global_combine(pass.accumulator, &comm)
    })
    .unwrap();

    for accumulator in reduced {
        assert_eq!(accumulator, single);
        assert_eq!(accumulator.total_rows(), rows.len() as f64);
    }
}

#[test]
fn empty_root_shard_fails_every_rank() {
    let rows = vec![SparseRowBuf::from_pairs(&[(0, 1.0)])];
    let verdicts = ThreadGroup::run(2, |comm| {
        let mut source = InMemorySource::shard(&rows, comm.rank(), comm.world_size(), 4)?;
        let mut trainer = Trainer::new(TrainConfig {
            k: 1,
            max_iter: 1,
            ..TrainConfig::default()
        })?;
        Ok(matches!(
            trainer.prepare(&mut source, &comm),
            Err(KMeansError::EmptyShard)
        ))
    })
    .unwrap();
    assert_eq!(verdicts, vec![true, true]);
}

#[test]
fn shards_may_disagree_on_feature_dimension() {
    let per_rank = [
        vec![
            SparseRowBuf::from_pairs(&[(0, 1.0), (1, 1.0)]),
            SparseRowBuf::from_pairs(&[(2, 4.0)]),
        ],
        Vec::new(),
        vec![SparseRowBuf::from_pairs(&[(6, 2.0)])],
    ];
    let config = TrainConfig {
        k: 1,
        max_iter: 2,
        seed: 1,
        block_size: 8,
    };
    let outcomes = ThreadGroup::run(3, |comm| {
        let mut source = InMemorySource::new(&per_rank[comm.rank()], config.block_size)?;
        let outcome = Trainer::new(config.clone())?.run(&mut source, &comm)?;
        assert_eq!(source.feature_dimension(), Some(7));
        Ok(outcome)
    })
    .unwrap();
    let third = 1.0 / 3.0;
    let expected = array![[third, third, 4.0 / 3.0, 0.0, 0.0, 0.0, 2.0 / 3.0]];
    for outcome in outcomes {
        assert_eq!(outcome.centroids.dim(), (1, 7));
        assert_eq!(outcome.history[1].total_rows, 3);
        for (got, want) in outcome.centroids.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12, "{got} vs {want}");
        }
    }
}

#[test]
fn libsvm_shards_train_like_the_whole_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for row in grid_rows() {
        let pairs: Vec<String> = row
            .indices
            .iter()
            .zip(&row.values)
            .map(|(idx, value)| format!("{idx}:{value}"))
            .collect();
        writeln!(file, "1 {}", pairs.join(" ")).unwrap();
    }
    file.flush().unwrap();
    let path = file.path().to_path_buf();
    let config = TrainConfig {
        k: 1,
        max_iter: 2,
        seed: 6,
        block_size: 4,
    };
    let sharded = ThreadGroup::run(3, |comm| {
        let mut source =
            LibSvmSource::open(&path, comm.rank(), comm.world_size(), config.block_size)?;
        Trainer::new(config.clone())?.run(&mut source, &comm)
    })
    .unwrap();

    let mut whole = LibSvmSource::open(&path, 0, 1, config.block_size).unwrap();
    let single = Trainer::new(config.clone())
        .unwrap()
        .run(&mut whole, &SingleProcess::new())
        .unwrap();
    for outcome in sharded {
        assert_eq!(outcome.centroids, single.centroids);
    }
}

fn arb_rows() -> impl Strategy<Value = Vec<SparseRowBuf>> {
    prop::collection::vec(
        prop::collection::btree_map(0u32..8, 1u8..6, 0..4).prop_map(|entries| {
            let pairs: Vec<(u32, f32)> = entries
                .into_iter()
                .map(|(idx, value)| (idx, f32::from(value)))
                .collect();
            SparseRowBuf::from_pairs(&pairs)
        }),
        0..30,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Summing per-shard accumulators gives the single-process accumulator
    /// for any world size and block size.
    #[test]
    fn reduction_is_independent_of_sharding(
        rows in arb_rows(),
        world_size in 1usize..5,
        block_size in 1usize..7,
        weights in prop::collection::vec(0u8..4, 3 * 8),
    ) {
        let centroids = Array2::from_shape_vec(
            (3, 8),
            weights.into_iter().map(f64::from).collect(),
        ).unwrap();

        let mut whole = InMemorySource::new(&rows, block_size).unwrap();
        whole.set_feature_dimension(8).unwrap();
        let single: Accumulator = local_accumulate(&mut whole, &centroids).unwrap().accumulator;

        let reduced = ThreadGroup::run(world_size, |comm| {
            let mut shard = InMemorySource::shard(&rows, comm.rank(), comm.world_size(), block_size)?;
            shard.set_feature_dimension(8)?;
            let pass = local_accumulate(&mut shard, &centroids)?;
            global_combine(pass.accumulator, &comm)
        }).unwrap();

        for accumulator in reduced {
            prop_assert_eq!(&accumulator, &single);
            prop_assert_eq!(accumulator.total_rows(), rows.len() as f64);
        }
    }
}
