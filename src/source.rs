//! Shard-local sparse data sources.
//!
//! A source hands out the rows of one rank's shard as a sequence of
//! [`SparseRowBlock`]s and can be rewound for another full pass. Shards are
//! contiguous row ranges chosen by [`partition_range`], so the shards of all
//! ranks partition the dataset.

use std::ops::Range;
use std::path::Path;

use tracing::debug;

use crate::accumulate::Accumulator;
use crate::sparse::{SparseRowBlock, SparseRowBuf};
use crate::{KMeansError, Result};

/// Iteration over one rank's shard of a sparse dataset.
pub trait SparseDataSource {
    /// Local maximum feature index + 1. Shards may disagree, so callers
    /// must max-reduce this across ranks before fixing the dimension.
    fn max_feature_index(&self) -> usize;

    /// Reset iteration to the first block of the shard.
    fn rewind(&mut self);

    /// Advance to the next block. Returns `false` once the shard is exhausted.
    fn next_block(&mut self) -> Result<bool>;

    /// Block at the current position; empty before the first `next_block`.
    fn current_block(&self) -> &SparseRowBlock;

    /// Fix the feature dimension used by subsequent accumulation.
    fn set_feature_dimension(&mut self, dim: usize) -> Result<()>;

    fn feature_dimension(&self) -> Option<usize>;

    /// Add every row of the current block into `accumulator` under its
    /// assigned cluster and bump that cluster's count.
    fn assign_and_accumulate(
        &self,
        assignments: &[usize],
        accumulator: &mut Accumulator,
    ) -> Result<()> {
        let dim = self.feature_dimension().ok_or_else(|| {
            KMeansError::InvalidState("feature dimension has not been set".into())
        })?;
        if accumulator.dim() != dim {
            return Err(KMeansError::InvalidState(format!(
                "accumulator covers {} features but the source was fixed to {dim}",
                accumulator.dim()
            )));
        }
        self.current_block()
            .accumulate_into(assignments, accumulator.matrix_mut())
    }
}

/// Contiguous row range `[n*rank/ws, n*(rank+1)/ws)` owned by `rank`.
pub fn partition_range(n: usize, rank: usize, world_size: usize) -> Result<Range<usize>> {
    if world_size == 0 {
        return Err(KMeansError::InvalidConfig(
            "world size must be greater than zero".into(),
        ));
    }
    if rank >= world_size {
        return Err(KMeansError::InvalidConfig(format!(
            "rank {rank} is outside a world of size {world_size}"
        )));
    }
    let bound = |r: usize| ((n as u128 * r as u128) / world_size as u128) as usize;
    Ok(bound(rank)..bound(rank + 1))
}

/// Pre-built blocks plus the iteration cursor shared by the concrete sources.
#[derive(Debug, Clone)]
struct ShardBlocks {
    blocks: Vec<SparseRowBlock>,
    cursor: Option<usize>,
    max_feature_index: usize,
    feature_dim: Option<usize>,
    empty: SparseRowBlock,
}

impl ShardBlocks {
    fn from_rows(rows: &[SparseRowBuf], block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(KMeansError::InvalidConfig(
                "block_size must be greater than zero".into(),
            ));
        }
        let blocks: Vec<SparseRowBlock> = rows
            .chunks(block_size)
            .map(|chunk| SparseRowBlock::from_rows(chunk.iter()))
            .collect();
        let max_feature_index = blocks
            .iter()
            .map(SparseRowBlock::max_feature_index)
            .max()
            .unwrap_or(0);
        Ok(Self {
            blocks,
            cursor: None,
            max_feature_index,
            feature_dim: None,
            empty: SparseRowBlock::new(),
        })
    }

    fn rewind(&mut self) {
        self.cursor = None;
    }

    fn next_block(&mut self) -> bool {
        let next = self.cursor.map_or(0, |c| c + 1);
        if next < self.blocks.len() {
            self.cursor = Some(next);
            true
        } else {
            self.cursor = Some(self.blocks.len());
            false
        }
    }

    fn current_block(&self) -> &SparseRowBlock {
        self.cursor
            .and_then(|c| self.blocks.get(c))
            .unwrap_or(&self.empty)
    }

    fn set_feature_dimension(&mut self, dim: usize) -> Result<()> {
        if dim < self.max_feature_index {
            return Err(KMeansError::InvalidState(format!(
                "feature dimension {dim} is smaller than the shard's max feature index {}",
                self.max_feature_index
            )));
        }
        self.feature_dim = Some(dim);
        Ok(())
    }

    fn num_rows(&self) -> usize {
        self.blocks.iter().map(SparseRowBlock::len).sum()
    }
}

/// Shard of an in-memory row list.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    shard: ShardBlocks,
}

impl InMemorySource {
    /// Take this rank's contiguous share of `rows`.
    pub fn shard(
        rows: &[SparseRowBuf],
        rank: usize,
        world_size: usize,
        block_size: usize,
    ) -> Result<Self> {
        let range = partition_range(rows.len(), rank, world_size)?;
        let shard = ShardBlocks::from_rows(&rows[range.clone()], block_size)?;
        debug!(
            rank,
            world_size,
            first_row = range.start,
            rows = range.len(),
            blocks = shard.blocks.len(),
            "opened in-memory shard"
        );
        Ok(Self { shard })
    }

    /// Whole dataset as a single shard.
    pub fn new(rows: &[SparseRowBuf], block_size: usize) -> Result<Self> {
        Self::shard(rows, 0, 1, block_size)
    }

    /// Number of rows in this shard.
    pub fn num_rows(&self) -> usize {
        self.shard.num_rows()
    }
}

impl SparseDataSource for InMemorySource {
    fn max_feature_index(&self) -> usize {
        self.shard.max_feature_index
    }

    fn rewind(&mut self) {
        self.shard.rewind();
    }

    fn next_block(&mut self) -> Result<bool> {
        Ok(self.shard.next_block())
    }

    fn current_block(&self) -> &SparseRowBlock {
        self.shard.current_block()
    }

    fn set_feature_dimension(&mut self, dim: usize) -> Result<()> {
        self.shard.set_feature_dimension(dim)
    }

    fn feature_dimension(&self) -> Option<usize> {
        self.shard.feature_dim
    }
}

/// Shard of a libsvm-style text file.
///
/// Each non-blank line that does not start with `#` is one row: an optional
/// label token followed by zero-based `index:weight` pairs. Rows are split
/// between ranks by position, and only this rank's lines are parsed.
#[derive(Debug, Clone)]
pub struct LibSvmSource {
    shard: ShardBlocks,
}

impl LibSvmSource {
    pub fn open<P: AsRef<Path>>(
        path: P,
        rank: usize,
        world_size: usize,
        block_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let source = Self::from_text(&text, rank, world_size, block_size)?;
        debug!(
            path = ?path,
            rank,
            rows = source.num_rows(),
            max_feature_index = source.shard.max_feature_index,
            "opened libsvm shard"
        );
        Ok(source)
    }

    /// Parse this rank's shard out of an in-memory libsvm document.
    pub fn from_text(
        text: &str,
        rank: usize,
        world_size: usize,
        block_size: usize,
    ) -> Result<Self> {
        let lines: Vec<(usize, &str)> = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .collect();
        let range = partition_range(lines.len(), rank, world_size)?;
        let rows = lines[range]
            .iter()
            .map(|&(line_no, line)| parse_libsvm_line(line_no, line))
            .collect::<Result<Vec<_>>>()?;
        let shard = ShardBlocks::from_rows(&rows, block_size)?;
        Ok(Self { shard })
    }

    pub fn num_rows(&self) -> usize {
        self.shard.num_rows()
    }
}

impl SparseDataSource for LibSvmSource {
    fn max_feature_index(&self) -> usize {
        self.shard.max_feature_index
    }

    fn rewind(&mut self) {
        self.shard.rewind();
    }

    fn next_block(&mut self) -> Result<bool> {
        Ok(self.shard.next_block())
    }

    fn current_block(&self) -> &SparseRowBlock {
        self.shard.current_block()
    }

    fn set_feature_dimension(&mut self, dim: usize) -> Result<()> {
        self.shard.set_feature_dimension(dim)
    }

    fn feature_dimension(&self) -> Option<usize> {
        self.shard.feature_dim
    }
}

fn parse_libsvm_line(line_no: usize, line: &str) -> Result<SparseRowBuf> {
    let malformed = |reason: String| KMeansError::DataFormat {
        line: line_no,
        reason,
    };
    let mut tokens = line.split_whitespace().peekable();
    // label, if present, is ignored
    if let Some(first) = tokens.peek() {
        if !first.contains(':') {
            first
                .parse::<f64>()
                .map_err(|_| malformed(format!("invalid label '{first}'")))?;
            tokens.next();
        }
    }

    let mut row = SparseRowBuf::default();
    for token in tokens {
        let (idx, value) = token
            .split_once(':')
            .ok_or_else(|| malformed(format!("expected index:weight, found '{token}'")))?;
        let idx: u32 = idx
            .parse()
            .map_err(|_| malformed(format!("invalid feature index '{idx}'")))?;
        let value: f32 = value
            .parse()
            .map_err(|_| malformed(format!("invalid weight '{value}'")))?;
        if !value.is_finite() || value < 0.0 {
            return Err(malformed(format!(
                "weight {value} for feature {idx} must be finite and non-negative"
            )));
        }
        row.indices.push(idx);
        row.values.push(value);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rows(n: usize) -> Vec<SparseRowBuf> {
        (0..n)
            .map(|i| SparseRowBuf::from_pairs(&[(i as u32, 1.0)]))
            .collect()
    }

    fn drain(source: &mut impl SparseDataSource) -> Vec<usize> {
        let mut sizes = Vec::new();
        source.rewind();
        while source.next_block().unwrap() {
            sizes.push(source.current_block().len());
        }
        sizes
    }

    #[test]
    fn partition_covers_every_row_once() {
        let n = 10;
        let ranges: Vec<_> = (0..3).map(|r| partition_range(n, r, 3).unwrap()).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);
        assert!(partition_range(n, 3, 3).is_err());
        assert!(partition_range(n, 0, 0).is_err());
    }

    #[test]
    fn in_memory_shard_blocks_and_rewinds() {
        let data = rows(7);
        let mut source = InMemorySource::shard(&data, 1, 2, 2).unwrap();
        assert_eq!(source.num_rows(), 4);
        assert_eq!(source.max_feature_index(), 7);
        assert!(source.current_block().is_empty());
        assert_eq!(drain(&mut source), vec![2, 2]);
        assert!(!source.next_block().unwrap());
        assert_eq!(drain(&mut source), vec![2, 2]);
        source.rewind();
        source.next_block().unwrap();
        assert_eq!(source.current_block().row(0).indices, &[3]);
    }

    #[test]
    fn feature_dimension_cannot_shrink_below_local_max() {
        let mut source = InMemorySource::new(&rows(4), 8).unwrap();
        assert!(source.set_feature_dimension(3).is_err());
        source.set_feature_dimension(6).unwrap();
        assert_eq!(source.feature_dimension(), Some(6));
    }

    #[test]
    fn assign_and_accumulate_requires_dimension() {
        let mut source = InMemorySource::new(&rows(2), 8).unwrap();
        source.next_block().unwrap();
        let mut acc = Accumulator::zeros(1, 2);
        assert!(matches!(
            source.assign_and_accumulate(&[0, 0], &mut acc),
            Err(KMeansError::InvalidState(_))
        ));
        source.set_feature_dimension(2).unwrap();
        source.assign_and_accumulate(&[0, 0], &mut acc).unwrap();
        assert_eq!(acc.counts(), vec![2.0]);
    }

    #[test]
    fn libsvm_lines_parse_with_optional_labels() {
        let text = "# header\n1 0:1.5 3:2\n\n2:0.5\n-1\n";
        let mut source = LibSvmSource::from_text(text, 0, 1, 16).unwrap();
        assert_eq!(source.num_rows(), 3);
        assert_eq!(source.max_feature_index(), 4);
        source.next_block().unwrap();
        let block = source.current_block();
        assert_eq!(block.row(0).indices, &[0, 3]);
        assert_eq!(block.row(0).values, &[1.5, 2.0]);
        assert_eq!(block.row(1).indices, &[2]);
        assert_eq!(block.row(2).nnz(), 0);
    }

    #[test]
    fn libsvm_malformed_rows_report_line_numbers() {
        for (text, line) in [
            ("1 0:1\n1 x:2\n", 2),
            ("1 0:1\n\n1 3\n", 3),
            ("abc 0:1\n", 1),
            ("1 0:-2\n", 1),
            ("1 0:nan\n", 1),
        ] {
            match LibSvmSource::from_text(text, 0, 1, 4) {
                Err(KMeansError::DataFormat { line: got, .. }) => assert_eq!(got, line, "{text:?}"),
                other => panic!("expected data format error for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn libsvm_only_parses_own_shard() {
        // the malformed last line belongs to rank 1
        let text = "1 0:1\n1 1:1\n1 2:1\nbroken\n";
        let source = LibSvmSource::from_text(text, 0, 2, 4).unwrap();
        assert_eq!(source.num_rows(), 2);
        assert!(LibSvmSource::from_text(text, 1, 2, 4).is_err());
    }

    #[test]
    fn libsvm_opens_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 0:1 1:1").unwrap();
        writeln!(file, "1 4:2").unwrap();
        let source = LibSvmSource::open(file.path(), 0, 1, 8).unwrap();
        assert_eq!(source.num_rows(), 2);
        assert_eq!(source.max_feature_index(), 5);
        let missing = LibSvmSource::open(file.path().with_extension("missing"), 0, 1, 8);
        assert!(matches!(missing, Err(KMeansError::Io(_))));
    }
}
