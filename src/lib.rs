//! Distributed k-means clustering over sparse, row-partitioned data.
//!
//! Every participating rank runs the same program over its own shard. A
//! shared centroid model is kept in sync purely through collective
//! operations: the root seeds the centroids and broadcasts them, and each
//! iteration sums per-cluster accumulators across ranks with an all-reduce
//! before every rank derives the identical new centroids.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod accumulate;
pub mod collective;
pub mod model;
pub mod source;
pub mod sparse;
pub mod train;

pub use accumulate::{global_combine, local_accumulate, nearest_centroid, Accumulator, LocalPass};
pub use collective::{agree, Communicator, ReduceOp, SingleProcess, ThreadCommunicator, ThreadGroup};
pub use model::CentroidModel;
pub use source::{partition_range, InMemorySource, LibSvmSource, SparseDataSource};
pub use sparse::{generate_sparse_rows, SparseRow, SparseRowBlock, SparseRowBuf};
pub use train::{IterationStats, TrainOutcome, TrainState, Trainer};

/// Dense matrix used for centroids and accumulators (rows = clusters).
pub type DataMatrix = Array2<f64>;

/// Error type used by operations in this crate.
///
/// Every variant is fatal for the run: a rank that stops early would leave
/// its peers blocked in the next collective call.
#[derive(Debug, Error)]
pub enum KMeansError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid trainer state: {0}")]
    InvalidState(String),
    #[error("root shard has no rows to sample initial centroids from")]
    EmptyShard,
    #[error("cluster {cluster} received no rows in iteration {iteration}")]
    EmptyCluster { cluster: usize, iteration: usize },
    #[error("collective mismatch: {0}")]
    CollectiveMismatch(String),
    #[error("malformed row at line {line}: {reason}")]
    DataFormat { line: usize, reason: String },
    #[error("a peer rank failed")]
    PeerFailed,
    #[error("rank {0} panicked")]
    RankPanicked(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl KMeansError {
    /// Process exit code reported by the binary for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            KMeansError::InvalidConfig(_) => 2,
            KMeansError::Io(_) => 3,
            KMeansError::DataFormat { .. } => 4,
            KMeansError::EmptyShard => 5,
            KMeansError::EmptyCluster { .. } => 6,
            KMeansError::CollectiveMismatch(_) => 7,
            KMeansError::InvalidState(_) => 8,
            KMeansError::RankPanicked(_) | KMeansError::SerdeJson(_) => 9,
            KMeansError::PeerFailed => 10,
        }
    }
}

/// Convenient alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, KMeansError>;

/// Configurable knobs for a distributed training run.
///
/// Every rank must be handed an identical configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrainConfig {
    /// Number of centroids.
    pub k: usize,
    /// Number of iterations; the loop never stops early.
    pub max_iter: usize,
    /// Seed for the root's initial row sampling.
    pub seed: u64,
    /// Rows per block handed out by the data sources.
    pub block_size: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            k: 8,
            max_iter: 10,
            seed: 0,
            block_size: 4096,
        }
    }
}

impl TrainConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(KMeansError::InvalidConfig(
                "k must be greater than zero".into(),
            ));
        }
        if self.max_iter == 0 {
            return Err(KMeansError::InvalidConfig(
                "max_iter must be greater than zero".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(KMeansError::InvalidConfig(
                "block_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
