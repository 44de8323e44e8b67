//! Collective communication trait and errors.
//!
//! The [`Communicator`] trait abstracts over the process ensemble (a single
//! process, an in-process thread ensemble, or an MPI world) so that the dust
//! library code in `ember-core` does not depend on how the ranks are realised.
//!
//! Every operation is *collective*: all ranks must call the same operations,
//! in the same order, with compatible arguments. A rank that skips or reorders
//! a call leaves the ensemble in an undefined state (usually a hang); the
//! backends do not try to detect this.

use thiserror::Error;

/// Errors originating from communicator backends.
///
/// None of these are recoverable: a failed collective means the ensemble has
/// diverged and the run must be abandoned.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("Rank {rank} is outside the ensemble of {size} processes")]
    InvalidRank { rank: usize, size: usize },

    #[error("Buffer length mismatch in {operation}: expected {expected}, got {actual}")]
    BufferMismatch {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Displacement table for {operation} has {actual} entries, expected one per rank ({expected})")]
    DisplacementMismatch {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Block at offset {offset} (length {block_len}) exceeds buffer of length {len}")]
    BlockOutOfRange {
        offset: usize,
        block_len: usize,
        len: usize,
    },

    #[error("An ensemble needs at least one process")]
    EmptyEnsemble,

    #[error("Exchange board poisoned by a failed rank")]
    Poisoned,

    #[error("Backend not available: {0}")]
    Unavailable(String),
}

/// Displacement tables indexed by rank, holding block offsets (in values, not
/// blocks) into a send or receive buffer.
pub type Displacements = [Vec<usize>];

/// An ensemble of cooperating processes communicating through collectives.
///
/// Rank and size are fixed for the lifetime of an instance. The root rank is
/// used only to elect who performs singleton duties (logging, file output);
/// data must be consistent on every rank after each collective regardless.
pub trait Communicator {
    /// Position of this process in the ensemble.
    fn rank(&self) -> usize;

    /// Number of processes in the ensemble.
    fn size(&self) -> usize;

    /// Whether cell data is distributed over the processes, as opposed to
    /// every process holding a full copy.
    fn is_data_parallel(&self) -> bool;

    /// Rank of the elected coordinator process.
    fn root(&self) -> usize {
        0
    }

    fn is_root(&self) -> bool {
        self.rank() == self.root()
    }

    fn is_multi_proc(&self) -> bool {
        self.size() > 1
    }

    /// Element-wise sum across the ensemble; the result lands on the root
    /// only. Non-root buffers are left untouched.
    fn reduce_sum(&self, buffer: &mut [f64]) -> Result<(), CommError>;

    /// Element-wise sum across the ensemble, delivered to every process.
    fn all_reduce_sum(&self, buffer: &mut [f64]) -> Result<(), CommError>;

    /// Element-wise minimum across the ensemble, delivered to every process.
    fn all_reduce_min(&self, buffer: &mut [f64]) -> Result<(), CommError>;

    /// Element-wise maximum across the ensemble, delivered to every process.
    fn all_reduce_max(&self, buffer: &mut [f64]) -> Result<(), CommError>;

    /// Logical OR of a flag across the ensemble, delivered to every process.
    fn all_reduce_or(&self, flag: &mut bool) -> Result<(), CommError>;

    /// Copy `buffer` from `sender` into the buffers of every other process.
    fn broadcast(&self, buffer: &mut [f64], sender: usize) -> Result<(), CommError>;

    /// Gather displaced blocks from every process into `recv` on `root`.
    ///
    /// `send` is a sequence of blocks of `block_len` values. Block `b` sent by
    /// process `p` lands at `recv[recv_displacements[p][b]..][..block_len]` on
    /// the root. Every process passes the same displacement table; `recv` is
    /// only written on the root.
    fn gather_irregular(
        &self,
        send: &[f64],
        block_len: usize,
        recv: &mut [f64],
        root: usize,
        recv_displacements: &Displacements,
    ) -> Result<(), CommError>;

    /// Exchange displaced blocks between every pair of processes.
    ///
    /// Process `p` sends the blocks starting at `send_displacements[q]` in
    /// `send` to process `q`; on `q` they land, in the same order, at
    /// `recv_displacements[p]` in `recv`.
    fn all_to_all_irregular(
        &self,
        send: &[f64],
        send_displacements: &Displacements,
        recv: &mut [f64],
        recv_displacements: &Displacements,
        block_len: usize,
    ) -> Result<(), CommError>;

    /// Block until every process has reached the same call. The `scope` only
    /// appears in diagnostics.
    fn barrier(&self, scope: &str) -> Result<(), CommError>;

    /// Sum a single value across the ensemble, delivered to every process.
    fn all_reduce_sum_scalar(&self, value: &mut f64) -> Result<(), CommError> {
        self.all_reduce_sum(std::slice::from_mut(value))
    }
}

/// Check that a displacement table has one entry per rank.
pub(crate) fn check_displacements(
    operation: &'static str,
    table: &Displacements,
    size: usize,
) -> Result<(), CommError> {
    if table.len() != size {
        return Err(CommError::DisplacementMismatch {
            operation,
            expected: size,
            actual: table.len(),
        });
    }
    Ok(())
}

/// Check that every block described by `offsets` fits in a buffer of `len`.
pub(crate) fn check_blocks(offsets: &[usize], block_len: usize, len: usize) -> Result<(), CommError> {
    for &offset in offsets {
        if offset + block_len > len {
            return Err(CommError::BlockOutOfRange {
                offset,
                block_len,
                len,
            });
        }
    }
    Ok(())
}

/// Copy the blocks at `offsets` out of `buffer`, concatenated.
pub(crate) fn pack_blocks(buffer: &[f64], offsets: &[usize], block_len: usize) -> Vec<f64> {
    let mut packed = Vec::with_capacity(offsets.len() * block_len);
    for &offset in offsets {
        packed.extend_from_slice(&buffer[offset..offset + block_len]);
    }
    packed
}

/// Scatter concatenated blocks from `packed` into `buffer` at `offsets`.
pub(crate) fn unpack_blocks(
    packed: &[f64],
    buffer: &mut [f64],
    offsets: &[usize],
    block_len: usize,
) -> Result<(), CommError> {
    if packed.len() != offsets.len() * block_len {
        return Err(CommError::BufferMismatch {
            operation: "unpack",
            expected: offsets.len() * block_len,
            actual: packed.len(),
        });
    }
    check_blocks(offsets, block_len, buffer.len())?;
    for (block, &offset) in packed.chunks_exact(block_len.max(1)).zip(offsets) {
        buffer[offset..offset + block_len].copy_from_slice(block);
    }
    Ok(())
}
