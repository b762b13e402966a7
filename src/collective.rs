//! Collective communication between ranks.
//!
//! [`Communicator`] is the contract the training loop relies on: broadcast
//! and all-reduce over flat `f64` buffers, with every rank calling the same
//! operations in the same order. Two implementations ship with the crate:
//! [`SingleProcess`] for a world of one, and [`ThreadGroup`], which runs each
//! rank on its own thread and rendezvouses on shared buffers.

use std::fmt;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{KMeansError, Result};

/// Element-wise operator applied by [`Communicator::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    fn apply(self, acc: f64, value: f64) -> f64 {
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Max => acc.max(value),
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceOp::Sum => write!(f, "sum"),
            ReduceOp::Max => write!(f, "max"),
        }
    }
}

/// Process-group operations shared by every rank of a run.
///
/// Both collectives are barriers. Every rank must issue them the same number
/// of times, in the same order and with buffers of the same length, or the
/// group deadlocks or fails with [`KMeansError::CollectiveMismatch`].
pub trait Communicator {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Overwrite every rank's `buffer` with the contents of `root`'s.
    fn broadcast(&self, buffer: &mut [f64], root: usize) -> Result<()>;

    /// Combine `buffer` element-wise across ranks; every rank receives the
    /// identical result.
    fn all_reduce(&self, buffer: &mut [f64], op: ReduceOp) -> Result<()>;

    /// Leave the group.
    fn finalize(self) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Let every rank learn whether a local, fallible step failed anywhere.
///
/// Costs one MAX all-reduce. The failing rank gets its own error back and
/// every other rank gets [`KMeansError::PeerFailed`], so no rank is left
/// waiting in a later collective.
pub fn agree<T, C>(communicator: &C, local: Result<T>) -> Result<T>
where
    C: Communicator + ?Sized,
{
    let mut failed = [if local.is_err() { 1.0 } else { 0.0 }];
    communicator.all_reduce(&mut failed, ReduceOp::Max)?;
    match local {
        Err(err) => Err(err),
        Ok(_) if failed[0] > 0.0 => Err(KMeansError::PeerFailed),
        Ok(value) => Ok(value),
    }
}

/// World of size one: collectives leave buffers untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl SingleProcess {
    pub fn new() -> Self {
        Self
    }
}

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, _buffer: &mut [f64], root: usize) -> Result<()> {
        if root != 0 {
            return Err(KMeansError::CollectiveMismatch(format!(
                "broadcast root {root} outside a world of size 1"
            )));
        }
        Ok(())
    }

    fn all_reduce(&self, _buffer: &mut [f64], _op: ReduceOp) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Broadcast { root: usize },
    AllReduce(ReduceOp),
}

#[derive(Debug)]
struct Contribution {
    kind: CallKind,
    data: Vec<f64>,
}

#[derive(Debug)]
struct Rendezvous {
    world_size: usize,
    slots: Mutex<Vec<Option<Contribution>>>,
    barrier: Barrier,
}

impl Rendezvous {
    // Nothing panics while holding the lock, so a poisoned guard is still
    // consistent.
    fn slots(&self) -> MutexGuard<'_, Vec<Option<Contribution>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process group of ranks, one thread per rank.
///
/// Each collective publishes the caller's buffer into a per-rank slot, waits
/// for every rank, and then lets each rank compute the result itself from
/// the slots in rank order. All ranks therefore produce bit-identical
/// results, and a shape or operation mismatch is reported on every rank.
pub struct ThreadGroup;

impl ThreadGroup {
    /// Create the communicators for a group of `world_size` ranks; hand one
    /// to each rank's thread.
    pub fn new(world_size: usize) -> Result<Vec<ThreadCommunicator>> {
        if world_size == 0 {
            return Err(KMeansError::InvalidConfig(
                "world size must be greater than zero".into(),
            ));
        }
        let shared = Arc::new(Rendezvous {
            world_size,
            slots: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier: Barrier::new(world_size),
        });
        debug!(world_size, "created thread group");
        Ok((0..world_size)
            .map(|rank| ThreadCommunicator {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }

    /// Run `rank_main` on `world_size` scoped threads and collect the
    /// per-rank results in rank order.
    ///
    /// On failure the lowest rank's error is returned, preferring a rank's
    /// own error over a [`KMeansError::PeerFailed`] echo of it.
    ///
    /// A rank that panics or returns early while its peers are still inside
    /// a collective leaves them blocked on the barrier, so
    /// [`KMeansError::RankPanicked`] is only reported for panics after the
    /// rank's last collective. Local failures that happen before any
    /// collective should go through [`agree`].
    pub fn run<T, F>(world_size: usize, rank_main: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(ThreadCommunicator) -> Result<T> + Sync,
    {
        let communicators = Self::new(world_size)?;
        let rank_main = &rank_main;
        let joined: Vec<Result<T>> = thread::scope(|scope| {
            let handles: Vec<_> = communicators
                .into_iter()
                .map(|comm| {
                    let rank = comm.rank;
                    (rank, scope.spawn(move || rank_main(comm)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or(Err(KMeansError::RankPanicked(rank)))
                })
                .collect()
        });
        let mut first_error = None;
        let mut values = Vec::with_capacity(joined.len());
        for result in joined {
            match result {
                Ok(value) => values.push(value),
                Err(KMeansError::PeerFailed) => {
                    first_error.get_or_insert(KMeansError::PeerFailed);
                }
                Err(err) => {
                    if matches!(first_error, None | Some(KMeansError::PeerFailed)) {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }
}

/// One rank's handle onto a [`ThreadGroup`].
#[derive(Debug)]
pub struct ThreadCommunicator {
    rank: usize,
    shared: Arc<Rendezvous>,
}

impl ThreadCommunicator {
    fn exchange(&self, kind: CallKind, buffer: &mut [f64]) -> Result<()> {
        trace!(rank = self.rank, ?kind, len = buffer.len(), "entering collective");
        self.shared.slots()[self.rank] = Some(Contribution {
            kind,
            data: buffer.to_vec(),
        });
        self.shared.barrier.wait();
        let outcome = combine(&self.shared.slots(), buffer);
        // Slots stay untouched until every rank has read them.
        self.shared.barrier.wait();
        self.shared.slots()[self.rank] = None;
        outcome
    }
}

fn combine(slots: &[Option<Contribution>], out: &mut [f64]) -> Result<()> {
    let contributions = slots
        .iter()
        .enumerate()
        .map(|(rank, slot)| {
            slot.as_ref().ok_or_else(|| {
                KMeansError::CollectiveMismatch(format!("rank {rank} did not contribute"))
            })
        })
        .collect::<Result<Vec<&Contribution>>>()?;

    // Validate against rank 0 so every rank reaches the same verdict.
    let reference = contributions[0];
    for (rank, contribution) in contributions.iter().enumerate().skip(1) {
        if contribution.kind != reference.kind {
            return Err(KMeansError::CollectiveMismatch(format!(
                "rank {rank} entered {:?} while rank 0 entered {:?}",
                contribution.kind, reference.kind
            )));
        }
        if contribution.data.len() != reference.data.len() {
            return Err(KMeansError::CollectiveMismatch(format!(
                "rank {rank} passed {} elements while rank 0 passed {}",
                contribution.data.len(),
                reference.data.len()
            )));
        }
    }

    match reference.kind {
        CallKind::Broadcast { root } => {
            let source = contributions.get(root).ok_or_else(|| {
                KMeansError::CollectiveMismatch(format!(
                    "broadcast root {root} outside a world of size {}",
                    contributions.len()
                ))
            })?;
            out.copy_from_slice(&source.data);
        }
        CallKind::AllReduce(op) => {
            out.copy_from_slice(&reference.data);
            for contribution in &contributions[1..] {
                for (slot, &value) in out.iter_mut().zip(&contribution.data) {
                    *slot = op.apply(*slot, value);
                }
            }
        }
    }
    Ok(())
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn broadcast(&self, buffer: &mut [f64], root: usize) -> Result<()> {
        self.exchange(CallKind::Broadcast { root }, buffer)
    }

    fn all_reduce(&self, buffer: &mut [f64], op: ReduceOp) -> Result<()> {
        self.exchange(CallKind::AllReduce(op), buffer)
    }

    fn finalize(self) -> Result<()> {
        self.shared.barrier.wait();
        debug!(rank = self.rank, "left thread group");
        Ok(())
    }
}
