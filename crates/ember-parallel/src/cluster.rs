//! MPI communicator for clusters.
//!
//! Wraps the world communicator of an MPI universe. The universe is owned by
//! the communicator, so MPI is initialized on construction and finalized when
//! the communicator is dropped; create exactly one per process, at start-up.
//!
//! Irregular gathers and all-to-all exchanges are staged through contiguous
//! buffers and dispatched as variable-count MPI collectives.
//!
//! Gated behind the `distributed` feature flag.

use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::{Count, Rank};

use crate::comm::{check_blocks, check_displacements, pack_blocks, unpack_blocks};
use crate::comm::{CommError, Communicator, Displacements};

/// Communicator over the MPI world.
pub struct MpiCommunicator {
    world: SimpleCommunicator,
    data_parallel: bool,
    // dropped last: finalizes MPI
    _universe: Universe,
}

impl MpiCommunicator {
    /// Initialize MPI and wrap its world communicator.
    pub fn initialize(data_parallel: bool) -> Result<Self, CommError> {
        let universe = mpi::initialize()
            .ok_or_else(|| CommError::Unavailable("MPI has already been initialized".into()))?;
        let world = universe.world();
        Ok(Self {
            world,
            data_parallel,
            _universe: universe,
        })
    }

    fn process_rank(&self, rank: usize) -> Result<Rank, CommError> {
        if rank >= self.size() {
            return Err(CommError::InvalidRank {
                rank,
                size: self.size(),
            });
        }
        Rank::try_from(rank).map_err(|_| CommError::InvalidRank {
            rank,
            size: self.size(),
        })
    }
}

fn to_count(n: usize) -> Result<Count, CommError> {
    Count::try_from(n).map_err(|_| CommError::Unavailable(format!("message of {} values exceeds MPI count range", n)))
}

/// Per-rank value counts and their prefix-sum displacements.
fn counts_and_displs(
    table: &Displacements,
    block_len: usize,
) -> Result<(Vec<Count>, Vec<Count>, usize), CommError> {
    let mut counts = Vec::with_capacity(table.len());
    let mut displs = Vec::with_capacity(table.len());
    let mut total = 0usize;
    for offsets in table {
        let n = offsets.len() * block_len;
        displs.push(to_count(total)?);
        counts.push(to_count(n)?);
        total += n;
    }
    Ok((counts, displs, total))
}

/// Scatter a staged receive buffer back to its displaced blocks.
fn unstage(
    staged: &[f64],
    counts: &[Count],
    displs: &[Count],
    recv: &mut [f64],
    table: &Displacements,
    block_len: usize,
) -> Result<(), CommError> {
    for (source, offsets) in table.iter().enumerate() {
        let start = displs[source] as usize;
        let end = start + counts[source] as usize;
        unpack_blocks(&staged[start..end], recv, offsets, block_len)?;
    }
    Ok(())
}

impl Communicator for MpiCommunicator {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn is_data_parallel(&self) -> bool {
        self.data_parallel
    }

    fn reduce_sum(&self, buffer: &mut [f64]) -> Result<(), CommError> {
        let root = self.world.process_at_rank(self.process_rank(self.root())?);
        if self.is_root() {
            let send = buffer.to_vec();
            root.reduce_into_root(&send[..], &mut *buffer, SystemOperation::sum());
        } else {
            root.reduce_into(&buffer[..], SystemOperation::sum());
        }
        Ok(())
    }

    fn all_reduce_sum(&self, buffer: &mut [f64]) -> Result<(), CommError> {
        let send = buffer.to_vec();
        self.world
            .all_reduce_into(&send[..], &mut *buffer, SystemOperation::sum());
        Ok(())
    }

    fn all_reduce_min(&self, buffer: &mut [f64]) -> Result<(), CommError> {
        let send = buffer.to_vec();
        self.world
            .all_reduce_into(&send[..], &mut *buffer, SystemOperation::min());
        Ok(())
    }

    fn all_reduce_max(&self, buffer: &mut [f64]) -> Result<(), CommError> {
        let send = buffer.to_vec();
        self.world
            .all_reduce_into(&send[..], &mut *buffer, SystemOperation::max());
        Ok(())
    }

    fn all_reduce_or(&self, flag: &mut bool) -> Result<(), CommError> {
        let send = *flag;
        self.world
            .all_reduce_into(&send, flag, SystemOperation::logical_or());
        Ok(())
    }

    fn broadcast(&self, buffer: &mut [f64], sender: usize) -> Result<(), CommError> {
        let sender = self.world.process_at_rank(self.process_rank(sender)?);
        sender.broadcast_into(&mut *buffer);
        Ok(())
    }

    fn gather_irregular(
        &self,
        send: &[f64],
        block_len: usize,
        recv: &mut [f64],
        root: usize,
        recv_displacements: &Displacements,
    ) -> Result<(), CommError> {
        check_displacements("gather_irregular", recv_displacements, self.size())?;
        let root_process = self.world.process_at_rank(self.process_rank(root)?);
        if self.rank() != root {
            root_process.gather_varcount_into(send);
            return Ok(());
        }

        let (counts, displs, total) = counts_and_displs(recv_displacements, block_len)?;
        let mut staged = vec![0.0; total];
        {
            let mut partition = PartitionMut::new(&mut staged[..], &counts[..], &displs[..]);
            root_process.gather_varcount_into_root(send, &mut partition);
        }
        unstage(&staged, &counts, &displs, recv, recv_displacements, block_len)
    }

    fn all_to_all_irregular(
        &self,
        send: &[f64],
        send_displacements: &Displacements,
        recv: &mut [f64],
        recv_displacements: &Displacements,
        block_len: usize,
    ) -> Result<(), CommError> {
        check_displacements("all_to_all_irregular", send_displacements, self.size())?;
        check_displacements("all_to_all_irregular", recv_displacements, self.size())?;

        let mut send_staged = Vec::new();
        for offsets in send_displacements {
            check_blocks(offsets, block_len, send.len())?;
            send_staged.extend(pack_blocks(send, offsets, block_len));
        }
        let (send_counts, send_displs, _) = counts_and_displs(send_displacements, block_len)?;
        let (recv_counts, recv_displs, recv_total) = counts_and_displs(recv_displacements, block_len)?;

        let mut recv_staged = vec![0.0; recv_total];
        {
            let send_partition = Partition::new(&send_staged[..], &send_counts[..], &send_displs[..]);
            let mut recv_partition =
                PartitionMut::new(&mut recv_staged[..], &recv_counts[..], &recv_displs[..]);
            self.world
                .all_to_all_varcount_into(&send_partition, &mut recv_partition);
        }
        unstage(
            &recv_staged,
            &recv_counts,
            &recv_displs,
            recv,
            recv_displacements,
            block_len,
        )
    }

    fn barrier(&self, scope: &str) -> Result<(), CommError> {
        log::debug!("Rank {} waiting for {}", self.rank(), scope);
        self.world.barrier();
        Ok(())
    }
}
