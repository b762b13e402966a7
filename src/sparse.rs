//! Compressed sparse row blocks.
//!
//! A block stores a batch of rows as `offsets`/`indices`/`values`: row `r`
//! owns the entries `offsets[r]..offsets[r + 1]` of the other two arrays.

use ndarray::ArrayView1;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::{DataMatrix, KMeansError, Result};

/// Owned sparse row, used to build blocks and in-memory datasets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseRowBuf {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseRowBuf {
    /// Build a row from `(feature, weight)` pairs.
    pub fn from_pairs(pairs: &[(u32, f32)]) -> Self {
        let (indices, values) = pairs.iter().copied().unzip();
        Self { indices, values }
    }

    pub fn as_row(&self) -> SparseRow<'_> {
        SparseRow {
            indices: &self.indices,
            values: &self.values,
        }
    }
}

/// Borrowed view of a single row inside a block.
#[derive(Debug, Clone, Copy)]
pub struct SparseRow<'a> {
    pub indices: &'a [u32],
    pub values: &'a [f32],
}

impl<'a> SparseRow<'a> {
    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Iterate `(feature, weight)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + 'a {
        let (indices, values) = (self.indices, self.values);
        indices
            .iter()
            .zip(values.iter())
            .map(|(&idx, &value)| (idx as usize, f64::from(value)))
    }

    /// Dot product against a dense vector. Indices must be in bounds.
    pub fn dot(&self, dense: &ArrayView1<f64>) -> f64 {
        self.iter().map(|(idx, value)| dense[idx] * value).sum()
    }

    /// Dot product against every row of `centroids`, one score per centroid.
    pub fn dot_centroids(&self, centroids: &DataMatrix) -> Vec<f64> {
        centroids
            .rows()
            .into_iter()
            .map(|centroid| self.dot(&centroid))
            .collect()
    }

    pub fn squared_norm(&self) -> f64 {
        self.iter().map(|(_, value)| value * value).sum()
    }

    /// Largest feature index + 1, or 0 for an empty row.
    pub fn max_feature_index(&self) -> usize {
        self.indices
            .iter()
            .map(|&idx| idx as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Batch of sparse rows in CSR layout.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseRowBlock {
    offsets: Vec<usize>,
    indices: Vec<u32>,
    values: Vec<f32>,
}

impl Default for SparseRowBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseRowBlock {
    /// Empty block with no rows.
    pub fn new() -> Self {
        Self {
            offsets: vec![0],
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a SparseRowBuf>,
    {
        let mut block = Self::new();
        for row in rows {
            block.push_row(row.as_row());
        }
        block
    }

    pub fn push_row(&mut self, row: SparseRow<'_>) {
        debug_assert_eq!(row.indices.len(), row.values.len());
        self.indices.extend_from_slice(row.indices);
        self.values.extend_from_slice(row.values);
        self.offsets.push(self.indices.len());
    }

    /// Number of rows in the block.
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of stored entries.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn row(&self, r: usize) -> SparseRow<'_> {
        let (start, end) = (self.offsets[r], self.offsets[r + 1]);
        SparseRow {
            indices: &self.indices[start..end],
            values: &self.values[start..end],
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = SparseRow<'_>> + '_ {
        (0..self.len()).map(move |r| self.row(r))
    }

    /// Largest feature index + 1 over all rows, or 0 for an empty block.
    pub fn max_feature_index(&self) -> usize {
        self.indices
            .iter()
            .map(|&idx| idx as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Fold every row into `accumulator[assignments[r]]`.
    ///
    /// The accumulator has `F + 1` columns: feature sums in `[0, F)` and the
    /// assigned-row count in column `F`. Rows are added in block order so the
    /// floating point result does not depend on scheduling.
    pub fn accumulate_into(&self, assignments: &[usize], accumulator: &mut DataMatrix) -> Result<()> {
        if assignments.len() != self.len() {
            return Err(KMeansError::InvalidState(format!(
                "block has {} rows but {} assignments were supplied",
                self.len(),
                assignments.len()
            )));
        }
        let (k, width) = accumulator.dim();
        if width == 0 {
            return Err(KMeansError::InvalidState(
                "accumulator has no count column".into(),
            ));
        }
        let dim = width - 1;
        for (row, &cid) in self.rows().zip(assignments) {
            if cid >= k {
                return Err(KMeansError::InvalidState(format!(
                    "assignment {cid} out of range for k = {k}"
                )));
            }
            let mut target = accumulator.row_mut(cid);
            for (idx, value) in row.iter() {
                if idx >= dim {
                    return Err(KMeansError::InvalidState(format!(
                        "feature {idx} exceeds feature dimension {dim}"
                    )));
                }
                target[idx] += value;
            }
            target[dim] += 1.0;
        }
        Ok(())
    }
}

/// Generate `n` random sparse rows over `dim` features with up to
/// `nnz_per_row` distinct non-negative entries each.
pub fn generate_sparse_rows(
    n: usize,
    dim: usize,
    nnz_per_row: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<SparseRowBuf> {
    let nnz = nnz_per_row.min(dim);
    (0..n)
        .map(|_| {
            let mut features = rand::seq::index::sample(rng, dim, nnz).into_vec();
            features.sort_unstable();
            let pairs: Vec<(u32, f32)> = features
                .into_iter()
                .map(|idx| (idx as u32, rng.gen_range(0.0f32..1.0)))
                .collect();
            SparseRowBuf::from_pairs(&pairs)
        })
        .collect()
}
