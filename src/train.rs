//! Fixed-iteration training loop.
//!
//! Every rank drives its own [`Trainer`] through the same sequence of
//! collectives:
//!
//! 1. `prepare`: MAX all-reduce of the local feature dimension, then the
//!    centroid broadcast from the root.
//! 2. `step` (`max_iter` times): local pass, SUM all-reduce of the
//!    accumulator, centroid update.
//!
//! There is no convergence test; the loop always runs `max_iter` iterations.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::accumulate::{global_combine, local_accumulate};
use crate::collective::{Communicator, ReduceOp};
use crate::model::CentroidModel;
use crate::source::SparseDataSource;
use crate::{DataMatrix, KMeansError, Result, TrainConfig};

/// Lifecycle of a [`Trainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrainState {
    Uninitialized,
    /// Dimension fixed and centroids seeded on every rank.
    Ready,
    Iterating { completed: usize },
    Done,
}

/// What one iteration produced, as seen from one rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationStats {
    pub iteration: usize,
    /// Globally assigned rows per cluster.
    pub cluster_sizes: Vec<u64>,
    /// Rows across all shards; equals the sum of `cluster_sizes`.
    pub total_rows: u64,
    /// Rows in this rank's shard.
    pub local_rows: usize,
    /// Sum of the best scores of this rank's rows.
    pub local_score_sum: f64,
}

/// Final model plus per-iteration diagnostics.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Centroids as rows (`k` × `dim`).
    pub centroids: DataMatrix,
    pub history: Vec<IterationStats>,
}

/// Per-rank driver of the synchronization protocol.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainConfig,
    state: TrainState,
    model: Option<CentroidModel>,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: TrainState::Uninitialized,
            model: None,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    /// Current model; `None` until [`Trainer::prepare`] has run.
    pub fn model(&self) -> Option<&CentroidModel> {
        self.model.as_ref()
    }

    /// Fix the global feature dimension, seed the centroids and hand the
    /// dimension to the source.
    pub fn prepare<S, C>(&mut self, source: &mut S, communicator: &C) -> Result<()>
    where
        S: SparseDataSource + ?Sized,
        C: Communicator + ?Sized,
    {
        if self.state != TrainState::Uninitialized {
            return Err(KMeansError::InvalidState(format!(
                "prepare called in state {:?}",
                self.state
            )));
        }

        let mut dim = [source.max_feature_index() as f64];
        communicator.all_reduce(&mut dim, ReduceOp::Max)?;
        let dim = dim[0] as usize;
        debug!(
            rank = communicator.rank(),
            local = source.max_feature_index(),
            global = dim,
            "fixed feature dimension"
        );

        let mut model = CentroidModel::new(self.config.k, dim);
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        model.initialize(source, communicator, &mut rng)?;
        source.set_feature_dimension(dim)?;

        self.model = Some(model);
        self.state = TrainState::Ready;
        Ok(())
    }

    /// Run one synchronization cycle: accumulate locally, sum globally,
    /// replace every centroid with the mean of its assigned rows.
    pub fn step<S, C>(&mut self, source: &mut S, communicator: &C) -> Result<IterationStats>
    where
        S: SparseDataSource + ?Sized,
        C: Communicator + ?Sized,
    {
        let iteration = match self.state {
            TrainState::Ready => 0,
            TrainState::Iterating { completed } => completed,
            other => {
                return Err(KMeansError::InvalidState(format!(
                    "step called in state {other:?}"
                )))
            }
        };
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| KMeansError::InvalidState("model is not initialised".into()))?;

        let pass = local_accumulate(source, model.centroids())?;
        let reduced = global_combine(pass.accumulator, communicator)?;
        model.update_from_sums(reduced.matrix(), iteration)?;

        let cluster_sizes: Vec<u64> = reduced.counts().iter().map(|&c| c as u64).collect();
        let stats = IterationStats {
            iteration,
            total_rows: cluster_sizes.iter().sum(),
            cluster_sizes,
            local_rows: pass.rows,
            local_score_sum: pass.score_sum,
        };

        let completed = iteration + 1;
        self.state = if completed >= self.config.max_iter {
            TrainState::Done
        } else {
            TrainState::Iterating { completed }
        };

        debug!(
            rank = communicator.rank(),
            iteration,
            local_rows = stats.local_rows,
            local_score_sum = stats.local_score_sum,
            "local pass reduced"
        );
        if communicator.rank() == 0 {
            info!(
                iteration,
                total_rows = stats.total_rows,
                cluster_sizes = ?stats.cluster_sizes,
                "finished iteration"
            );
        }
        Ok(stats)
    }

    /// Prepare and run all `max_iter` iterations.
    pub fn run<S, C>(mut self, source: &mut S, communicator: &C) -> Result<TrainOutcome>
    where
        S: SparseDataSource + ?Sized,
        C: Communicator + ?Sized,
    {
        self.prepare(source, communicator)?;
        let mut history = Vec::with_capacity(self.config.max_iter);
        while self.state != TrainState::Done {
            history.push(self.step(source, communicator)?);
        }
        let centroids = self
            .model
            .take()
            .map(CentroidModel::into_centroids)
            .ok_or_else(|| KMeansError::InvalidState("model is not initialised".into()))?;
        Ok(TrainOutcome { centroids, history })
    }
}
