//! Nearest-centroid assignment and per-cluster accumulation.
//!
//! One iteration is split into two explicit steps: [`local_accumulate`]
//! makes a full pass over this rank's shard, and [`global_combine`] sums the
//! resulting accumulators across all ranks.

use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;

use crate::collective::{Communicator, ReduceOp};
use crate::source::SparseDataSource;
use crate::sparse::SparseRow;
use crate::{DataMatrix, KMeansError, Result};

/// Dense `K × (F + 1)` matrix of per-cluster feature sums and row counts.
///
/// Columns `[0, F)` hold the sum of the rows assigned to each cluster and
/// column `F` holds how many rows were assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    matrix: DataMatrix,
}

impl Accumulator {
    pub fn zeros(k: usize, dim: usize) -> Self {
        Self {
            matrix: Array2::zeros((k, dim + 1)),
        }
    }

    /// Number of clusters.
    pub fn k(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of features (the count column excluded).
    pub fn dim(&self) -> usize {
        self.matrix.ncols() - 1
    }

    pub fn matrix(&self) -> &DataMatrix {
        &self.matrix
    }

    pub fn matrix_mut(&mut self) -> &mut DataMatrix {
        &mut self.matrix
    }

    /// Per-cluster feature sums.
    pub fn sums(&self) -> ArrayView2<'_, f64> {
        self.matrix.slice(s![.., ..self.dim()])
    }

    /// Per-cluster assigned-row counts.
    pub fn counts(&self) -> Vec<f64> {
        self.matrix.column(self.dim()).to_vec()
    }

    pub fn total_rows(&self) -> f64 {
        self.matrix.column(self.dim()).sum()
    }

    fn as_mut_slice(&mut self) -> Result<&mut [f64]> {
        self.matrix
            .as_slice_mut()
            .ok_or_else(|| KMeansError::InvalidState("accumulator is not contiguous".into()))
    }
}

/// Output of one local pass over the shard.
#[derive(Debug, Clone)]
pub struct LocalPass {
    pub accumulator: Accumulator,
    /// Rows visited on this rank.
    pub rows: usize,
    /// Sum of every row's best score.
    pub score_sum: f64,
}

/// Best-scoring centroid for `row` and its score.
///
/// The score is `row · centroid / ||row||`. Dividing by the row's own norm
/// does not change the ranking, it only makes scores comparable across rows.
/// A row without entries scores 0 everywhere. Ties go to the lowest index.
pub fn nearest_centroid(row: SparseRow<'_>, centroids: &DataMatrix) -> (usize, f64) {
    let norm = row.squared_norm().sqrt();
    let mut best = 0usize;
    let mut best_score = f64::NEG_INFINITY;
    for (cid, centroid) in centroids.rows().into_iter().enumerate() {
        let score = if norm > 0.0 {
            row.dot(&centroid) / norm
        } else {
            0.0
        };
        if score > best_score {
            best_score = score;
            best = cid;
        }
    }
    (best, best_score)
}

/// Assign every row of the local shard and fold it into a fresh accumulator.
///
/// Assignment within a block runs on the rayon pool; rows are then added in
/// block order so the local sums are independent of thread scheduling.
pub fn local_accumulate<S>(source: &mut S, centroids: &DataMatrix) -> Result<LocalPass>
where
    S: SparseDataSource + ?Sized,
{
    let dim = source.feature_dimension().ok_or_else(|| {
        KMeansError::InvalidState("feature dimension has not been set".into())
    })?;
    if centroids.ncols() != dim {
        return Err(KMeansError::InvalidState(format!(
            "centroids have {} features but the source was fixed to {dim}",
            centroids.ncols()
        )));
    }

    let mut accumulator = Accumulator::zeros(centroids.nrows(), dim);
    let mut rows = 0usize;
    let mut score_sum = 0.0;

    source.rewind();
    while source.next_block()? {
        let block = source.current_block();
        let scored: Vec<(usize, f64)> = (0..block.len())
            .into_par_iter()
            .map(|r| nearest_centroid(block.row(r), centroids))
            .collect();
        let assignments: Vec<usize> = scored.iter().map(|&(cid, _)| cid).collect();
        score_sum += scored.iter().map(|&(_, score)| score).sum::<f64>();
        rows += block.len();
        source.assign_and_accumulate(&assignments, &mut accumulator)?;
    }

    Ok(LocalPass {
        accumulator,
        rows,
        score_sum,
    })
}

/// Sum `accumulator` element-wise across every rank.
///
/// This is a collective call: every rank must reach it once per iteration
/// with an accumulator of the same shape.
pub fn global_combine<C>(mut accumulator: Accumulator, communicator: &C) -> Result<Accumulator>
where
    C: Communicator + ?Sized,
{
    communicator.all_reduce(accumulator.as_mut_slice()?, ReduceOp::Sum)?;
    Ok(accumulator)
}
