//! Assignment of abstract work indices to the processes of an ensemble.
//!
//! A [`ProcessAssigner`] translates between the *absolute* index of a piece of
//! work (shared by all processes) and its *relative* index among the pieces
//! assigned to the calling process. Two policies are available:
//!
//! | Policy | Ownership of index `t` | Use |
//! |--------|------------------------|-----|
//! | [`StaggeredAssigner`] | rank `t mod P` | work whose cost grows with its index |
//! | [`IdenticalAssigner`] | every rank | data that every process already holds |

use thiserror::Error;

use crate::comm::Communicator;

/// Errors raised while setting up an assigner.
#[derive(Debug, Error)]
pub enum AssignError {
    #[error("Invalid ensemble: rank {rank} in an ensemble of {size} processes")]
    InvalidEnsemble { rank: usize, size: usize },
}

/// Maps an index range onto the process ensemble.
pub trait ProcessAssigner: Send + Sync {
    /// Assign `size · blocks` indices, conceptually `blocks` consecutive
    /// cycles of `size` indices each.
    fn assign(&mut self, size: usize, blocks: usize);

    /// Number of indices assigned to this process.
    fn count(&self) -> usize;

    /// Number of indices assigned over the whole ensemble.
    fn total(&self) -> usize;

    /// Translate a process-local index into the index shared by all processes.
    fn absolute_index(&self, relative: usize) -> usize;

    /// Translate a shared index into the process-local index, or `None` if
    /// this process does not own it.
    fn relative_index(&self, absolute: usize) -> Option<usize>;

    /// Rank of the process owning a shared index.
    fn rank_for_index(&self, absolute: usize) -> usize;

    /// `true` if processes own disjoint subsets of the range, `false` if every
    /// process owns all of it.
    fn is_distributing(&self) -> bool;

    /// Whether the calling process owns the given shared index.
    fn owns(&self, absolute: usize) -> bool {
        self.relative_index(absolute).is_some()
    }
}

fn check_ensemble(rank: usize, size: usize) -> Result<(), AssignError> {
    if size == 0 || rank >= size {
        return Err(AssignError::InvalidEnsemble { rank, size });
    }
    Ok(())
}

/// Distributes indices round-robin: index `t` within a block goes to rank
/// `t mod P`.
///
/// With `blocks > 1` the scheme restarts for every block of `size` indices,
/// and blocks are laid out contiguously in the absolute numbering.
#[derive(Debug, Clone)]
pub struct StaggeredAssigner {
    rank: usize,
    nprocs: usize,
    block_size: usize,
    blocks: usize,
    /// Number of indices in one block owned by this rank.
    values_in_block: usize,
}

impl StaggeredAssigner {
    pub fn new(rank: usize, nprocs: usize) -> Result<Self, AssignError> {
        check_ensemble(rank, nprocs)?;
        Ok(Self {
            rank,
            nprocs,
            block_size: 0,
            blocks: 0,
            values_in_block: 0,
        })
    }

    /// Create an assigner for the calling rank of `comm`.
    pub fn for_comm(comm: &dyn Communicator) -> Result<Self, AssignError> {
        Self::new(comm.rank(), comm.size())
    }
}

impl ProcessAssigner for StaggeredAssigner {
    fn assign(&mut self, size: usize, blocks: usize) {
        self.block_size = size;
        self.blocks = blocks;
        // indices t in [0, size) with t mod P == rank
        self.values_in_block = if size > self.rank {
            (size - self.rank).div_ceil(self.nprocs)
        } else {
            0
        };
    }

    fn count(&self) -> usize {
        self.values_in_block * self.blocks
    }

    fn total(&self) -> usize {
        self.block_size * self.blocks
    }

    fn absolute_index(&self, relative: usize) -> usize {
        if self.values_in_block == 0 {
            return self.rank;
        }
        let block = relative / self.values_in_block;
        let in_block = relative % self.values_in_block;
        block * self.block_size + self.rank + in_block * self.nprocs
    }

    fn relative_index(&self, absolute: usize) -> Option<usize> {
        if absolute >= self.total() {
            return None;
        }
        let block = absolute / self.block_size;
        let in_block = absolute % self.block_size;
        if in_block % self.nprocs != self.rank {
            return None;
        }
        Some(block * self.values_in_block + (in_block - self.rank) / self.nprocs)
    }

    fn rank_for_index(&self, absolute: usize) -> usize {
        if self.block_size == 0 {
            return absolute % self.nprocs;
        }
        (absolute % self.block_size) % self.nprocs
    }

    fn is_distributing(&self) -> bool {
        true
    }
}

/// Assigns every index to every process.
///
/// Used when each process holds a full copy of the data and should compute
/// redundantly instead of redistributing. Since every rank owns every index,
/// [`rank_for_index`](ProcessAssigner::rank_for_index) reports the calling
/// rank.
#[derive(Debug, Clone)]
pub struct IdenticalAssigner {
    rank: usize,
    total: usize,
}

impl IdenticalAssigner {
    pub fn new(rank: usize, nprocs: usize) -> Result<Self, AssignError> {
        check_ensemble(rank, nprocs)?;
        Ok(Self { rank, total: 0 })
    }

    pub fn for_comm(comm: &dyn Communicator) -> Result<Self, AssignError> {
        Self::new(comm.rank(), comm.size())
    }
}

impl ProcessAssigner for IdenticalAssigner {
    fn assign(&mut self, size: usize, blocks: usize) {
        self.total = size * blocks;
    }

    fn count(&self) -> usize {
        self.total
    }

    fn total(&self) -> usize {
        self.total
    }

    fn absolute_index(&self, relative: usize) -> usize {
        relative
    }

    fn relative_index(&self, absolute: usize) -> Option<usize> {
        (absolute < self.total).then_some(absolute)
    }

    fn rank_for_index(&self, _absolute: usize) -> usize {
        self.rank
    }

    fn is_distributing(&self) -> bool {
        false
    }
}

/// Build an assigner of the requested policy, already assigned.
pub fn assigned(
    distributing: bool,
    comm: &dyn Communicator,
    size: usize,
    blocks: usize,
) -> Result<Box<dyn ProcessAssigner>, AssignError> {
    let mut assigner: Box<dyn ProcessAssigner> = if distributing {
        Box::new(StaggeredAssigner::for_comm(comm)?)
    } else {
        Box::new(IdenticalAssigner::for_comm(comm)?)
    };
    assigner.assign(size, blocks);
    Ok(assigner)
}
