//! Dense centroid matrix shared (by replication) across ranks.

use ndarray::{s, Array2};
use rand::Rng;
use tracing::{debug, info};

use crate::collective::Communicator;
use crate::source::SparseDataSource;
use crate::{DataMatrix, KMeansError, Result};

const ROOT: usize = 0;

/// `K × F` centroid matrix.
///
/// Outside of [`CentroidModel::normalize`], the matrix only changes from the
/// result of a collective, which keeps it bit-identical on every rank.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidModel {
    centroids: DataMatrix,
}

impl CentroidModel {
    /// Zero-initialised model with `k` centroids over `dim` features.
    pub fn new(k: usize, dim: usize) -> Self {
        Self {
            centroids: Array2::zeros((k, dim)),
        }
    }

    pub fn from_centroids(centroids: DataMatrix) -> Self {
        Self { centroids }
    }

    pub fn k(&self) -> usize {
        self.centroids.nrows()
    }

    pub fn dim(&self) -> usize {
        self.centroids.ncols()
    }

    pub fn centroids(&self) -> &DataMatrix {
        &self.centroids
    }

    pub fn into_centroids(self) -> DataMatrix {
        self.centroids
    }

    /// Seed the centroids from the root's first block and broadcast them.
    ///
    /// The root draws `k` rows uniformly (with replacement) from its first
    /// block and adds each into one centroid row; other ranks do not sample.
    /// The broadcast buffer carries the root's block size in a trailing slot,
    /// so an empty root shard is detected by every rank after the same
    /// collective and all of them fail with [`KMeansError::EmptyShard`].
    pub fn initialize<S, C, R>(&mut self, source: &mut S, communicator: &C, rng: &mut R) -> Result<()>
    where
        S: SparseDataSource + ?Sized,
        C: Communicator + ?Sized,
        R: Rng,
    {
        let (k, dim) = self.centroids.dim();
        let mut buffer = vec![0.0f64; k * dim + 1];

        if communicator.rank() == ROOT {
            source.rewind();
            source.next_block()?;
            let block = source.current_block();
            if !block.is_empty() {
                for cid in 0..k {
                    let seeded = &mut buffer[cid * dim..(cid + 1) * dim];
                    let pick = rng.gen_range(0..block.len());
                    for (idx, value) in block.row(pick).iter() {
                        if idx >= dim {
                            return Err(KMeansError::InvalidState(format!(
                                "sampled feature {idx} exceeds feature dimension {dim}"
                            )));
                        }
                        seeded[idx] += value;
                    }
                    debug!(cluster = cid, row = pick, "seeded centroid");
                }
            }
            buffer[k * dim] = block.len() as f64;
        }

        communicator.broadcast(&mut buffer, ROOT)?;

        let sampled_rows = buffer[k * dim];
        if sampled_rows == 0.0 {
            return Err(KMeansError::EmptyShard);
        }
        self.centroids = Array2::from_shape_vec((k, dim), buffer[..k * dim].to_vec())
            .map_err(|err| KMeansError::InvalidState(err.to_string()))?;
        info!(
            rank = communicator.rank(),
            k,
            dim,
            sampled_rows,
            "centroids initialised from root sample"
        );
        Ok(())
    }

    /// Scale every centroid to unit L2 norm.
    ///
    /// Centroids whose norm is below `1e-6` are left as they are. The
    /// training loop never calls this; it is kept for callers that want
    /// cosine-style centroids.
    pub fn normalize(&mut self) {
        for mut row in self.centroids.rows_mut() {
            let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm < 1e-6 {
                continue;
            }
            row /= norm;
        }
    }

    /// Replace the centroids with the per-cluster means held in a globally
    /// reduced accumulator (`K × (F + 1)`, counts in the last column).
    pub(crate) fn update_from_sums(&mut self, reduced: &DataMatrix, iteration: usize) -> Result<()> {
        let (k, dim) = self.centroids.dim();
        if reduced.dim() != (k, dim + 1) {
            return Err(KMeansError::InvalidState(format!(
                "accumulator shape {:?} does not match {k} centroids over {dim} features",
                reduced.dim()
            )));
        }
        let counts = reduced.column(dim);
        if let Some(cluster) = counts.iter().position(|&count| count == 0.0) {
            return Err(KMeansError::EmptyCluster { cluster, iteration });
        }
        self.centroids.assign(&reduced.slice(s![.., ..dim]));
        for (mut row, &count) in self.centroids.rows_mut().into_iter().zip(counts.iter()) {
            row /= count;
        }
        Ok(())
    }
}
