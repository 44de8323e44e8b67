//! In-process ensemble of ranks running on threads.
//!
//! [`ThreadCommunicator::ensemble`] creates one communicator per rank; each is
//! handed to its own thread (typically inside [`std::thread::scope`]). Ranks
//! exchange data through a shared board of per-rank slots:
//!
//! 1. every rank deposits its contribution in its own slot,
//! 2. all ranks meet at a barrier,
//! 3. every rank reads what it needs from the board,
//! 4. all ranks meet at a second barrier before the slots can be reused.
//!
//! This gives the same collective semantics as an MPI world without leaving
//! the process, which makes multi-rank behaviour testable.

use std::sync::{Arc, Barrier, Mutex};

use crate::comm::{check_blocks, check_displacements, pack_blocks, unpack_blocks};
use crate::comm::{CommError, Communicator, Displacements};

/// Parcels deposited by one rank for one collective.
type Parcels = Vec<Vec<f64>>;

struct Board {
    barrier: Barrier,
    slots: Mutex<Vec<Parcels>>,
}

/// One rank of an in-process thread ensemble.
pub struct ThreadCommunicator {
    rank: usize,
    size: usize,
    data_parallel: bool,
    board: Arc<Board>,
}

impl ThreadCommunicator {
    /// Create the communicators for an ensemble of `size` ranks, ordered by
    /// rank.
    pub fn ensemble(size: usize, data_parallel: bool) -> Result<Vec<Self>, CommError> {
        if size == 0 {
            return Err(CommError::EmptyEnsemble);
        }
        let board = Arc::new(Board {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        Ok((0..size)
            .map(|rank| Self {
                rank,
                size,
                data_parallel,
                board: Arc::clone(&board),
            })
            .collect())
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.size {
            return Err(CommError::InvalidRank {
                rank,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Run one deposit/read cycle on the board.
    ///
    /// Both barriers are always reached once the deposit succeeded, so an
    /// error raised by `read` on one rank does not strand the others.
    fn exchange<R>(
        &self,
        contribution: Parcels,
        read: impl FnOnce(&[Parcels]) -> Result<R, CommError>,
    ) -> Result<R, CommError> {
        {
            let mut slots = self.board.slots.lock().map_err(|_| CommError::Poisoned)?;
            slots[self.rank] = contribution;
        }
        self.board.barrier.wait();
        let result = match self.board.slots.lock() {
            Ok(slots) => read(&slots),
            Err(_) => Err(CommError::Poisoned),
        };
        self.board.barrier.wait();
        result
    }

    fn all_reduce_with(
        &self,
        operation: &'static str,
        buffer: &mut [f64],
        combine: impl Fn(f64, f64) -> f64,
    ) -> Result<(), CommError> {
        let reduced = self.exchange(vec![buffer.to_vec()], |slots| {
            reduce_slots(operation, slots, buffer.len(), &combine)
        })?;
        buffer.copy_from_slice(&reduced);
        Ok(())
    }
}

/// Fold the first parcel of every slot element-wise.
fn reduce_slots(
    operation: &'static str,
    slots: &[Parcels],
    len: usize,
    combine: &impl Fn(f64, f64) -> f64,
) -> Result<Vec<f64>, CommError> {
    let mut parcels = slots.iter().map(|slot| slot.first().map(Vec::as_slice).unwrap_or(&[]));
    let mut reduced = parcels.next().unwrap_or(&[]).to_vec();
    for parcel in parcels {
        if parcel.len() != len {
            return Err(CommError::BufferMismatch {
                operation,
                expected: len,
                actual: parcel.len(),
            });
        }
        for (acc, &value) in reduced.iter_mut().zip(parcel) {
            *acc = combine(*acc, value);
        }
    }
    if reduced.len() != len {
        return Err(CommError::BufferMismatch {
            operation,
            expected: len,
            actual: reduced.len(),
        });
    }
    Ok(reduced)
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_data_parallel(&self) -> bool {
        self.data_parallel
    }

    fn reduce_sum(&self, buffer: &mut [f64]) -> Result<(), CommError> {
        let root = self.root();
        let reduced = self.exchange(vec![buffer.to_vec()], |slots| {
            reduce_slots("reduce_sum", slots, buffer.len(), &|a, b| a + b)
        })?;
        if self.rank == root {
            buffer.copy_from_slice(&reduced);
        }
        Ok(())
    }

    fn all_reduce_sum(&self, buffer: &mut [f64]) -> Result<(), CommError> {
        self.all_reduce_with("all_reduce_sum", buffer, |a, b| a + b)
    }

    fn all_reduce_min(&self, buffer: &mut [f64]) -> Result<(), CommError> {
        self.all_reduce_with("all_reduce_min", buffer, f64::min)
    }

    fn all_reduce_max(&self, buffer: &mut [f64]) -> Result<(), CommError> {
        self.all_reduce_with("all_reduce_max", buffer, f64::max)
    }

    fn all_reduce_or(&self, flag: &mut bool) -> Result<(), CommError> {
        let mut encoded = [if *flag { 1.0 } else { 0.0 }];
        self.all_reduce_with("all_reduce_or", &mut encoded, f64::max)?;
        *flag = encoded[0] > 0.0;
        Ok(())
    }

    fn broadcast(&self, buffer: &mut [f64], sender: usize) -> Result<(), CommError> {
        self.check_rank(sender)?;
        let contribution = if self.rank == sender {
            vec![buffer.to_vec()]
        } else {
            Vec::new()
        };
        let received = self.exchange(contribution, |slots| {
            Ok(slots[sender].first().cloned().unwrap_or_default())
        })?;
        if received.len() != buffer.len() {
            return Err(CommError::BufferMismatch {
                operation: "broadcast",
                expected: buffer.len(),
                actual: received.len(),
            });
        }
        buffer.copy_from_slice(&received);
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
        self.check_rank(root)?;
        check_displacements("gather_irregular", recv_displacements, self.size)?;
        let is_root = self.rank == root;
        self.exchange(vec![send.to_vec()], |slots| {
            if !is_root {
                return Ok(());
            }
            for (source, slot) in slots.iter().enumerate() {
                let parcel = slot.first().map(Vec::as_slice).unwrap_or(&[]);
                unpack_blocks(parcel, recv, &recv_displacements[source], block_len)?;
            }
            Ok(())
        })
    }

    fn all_to_all_irregular(
        &self,
        send: &[f64],
        send_displacements: &Displacements,
        recv: &mut [f64],
        recv_displacements: &Displacements,
        block_len: usize,
    ) -> Result<(), CommError> {
        check_displacements("all_to_all_irregular", send_displacements, self.size)?;
        check_displacements("all_to_all_irregular", recv_displacements, self.size)?;
        for offsets in send_displacements {
            check_blocks(offsets, block_len, send.len())?;
        }

        // one parcel per destination rank
        let parcels: Parcels = send_displacements
            .iter()
            .map(|offsets| pack_blocks(send, offsets, block_len))
            .collect();
        let rank = self.rank;
        self.exchange(parcels, |slots| {
            for (source, slot) in slots.iter().enumerate() {
                let parcel = slot.get(rank).map(Vec::as_slice).unwrap_or(&[]);
                unpack_blocks(parcel, recv, &recv_displacements[source], block_len)?;
            }
            Ok(())
        })
    }

    fn barrier(&self, scope: &str) -> Result<(), CommError> {
        log::debug!("Rank {} waiting for {}", self.rank, scope);
        self.board.barrier.wait();
        Ok(())
    }
}
