//! Single-process communicator.

use crate::comm::{check_blocks, check_displacements, pack_blocks, unpack_blocks};
use crate::comm::{CommError, Communicator, Displacements};

/// Communicator for an ensemble of exactly one process.
///
/// Reductions and broadcasts are identities; gathers and all-to-all copy the
/// local blocks into place.
#[derive(Debug, Clone, Default)]
pub struct SerialCommunicator {
    data_parallel: bool,
}

impl SerialCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a serial communicator reporting the given data-parallel flag.
    pub fn with_data_parallel(data_parallel: bool) -> Self {
        Self { data_parallel }
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank != 0 {
            return Err(CommError::InvalidRank { rank, size: 1 });
        }
        Ok(())
    }
}

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn is_data_parallel(&self) -> bool {
        self.data_parallel
    }

    fn reduce_sum(&self, _buffer: &mut [f64]) -> Result<(), CommError> {
        Ok(())
    }

    fn all_reduce_sum(&self, _buffer: &mut [f64]) -> Result<(), CommError> {
        Ok(())
    }

    fn all_reduce_min(&self, _buffer: &mut [f64]) -> Result<(), CommError> {
        Ok(())
    }

    fn all_reduce_max(&self, _buffer: &mut [f64]) -> Result<(), CommError> {
        Ok(())
    }

    fn all_reduce_or(&self, _flag: &mut bool) -> Result<(), CommError> {
        Ok(())
    }

    fn broadcast(&self, _buffer: &mut [f64], sender: usize) -> Result<(), CommError> {
        self.check_rank(sender)
    }

    fn gather_irregular(
        &self,
        send: &[f64],
        block_len: usize,
        recv: &mut [f64],
        root: usize,
        recv_displacements: &Displacements,
    ) -> Result<(), CommError> {
        self.check_rank(root)?;
        check_displacements("gather_irregular", recv_displacements, 1)?;
        unpack_blocks(send, recv, &recv_displacements[0], block_len)
    }

    fn all_to_all_irregular(
        &self,
        send: &[f64],
        send_displacements: &Displacements,
        recv: &mut [f64],
        recv_displacements: &Displacements,
        block_len: usize,
    ) -> Result<(), CommError> {
        check_displacements("all_to_all_irregular", send_displacements, 1)?;
        check_displacements("all_to_all_irregular", recv_displacements, 1)?;
        check_blocks(&send_displacements[0], block_len, send.len())?;
        let packed = pack_blocks(send, &send_displacements[0], block_len);
        unpack_blocks(&packed, recv, &recv_displacements[0], block_len)
    }

    fn barrier(&self, scope: &str) -> Result<(), CommError> {
        log::debug!("Barrier reached: {}", scope);
        Ok(())
    }
}
