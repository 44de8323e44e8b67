//! Two-dimensional table partitioned over the process ensemble.
//!
//! A [`ParallelTable`] is logically a `rows × cols` array of `f64`. Along its
//! distribution [`Axis`] each process holds only the lanes (rows or columns)
//! assigned to it; the other axis stays fully resident. After all local writes
//! a collective [`sync`](ParallelTable::sync) makes every value available on
//! every process.
//!
//! # Lifecycle
//!
//! `Uninitialized → Writing → Synced`. [`initialize`](ParallelTable::initialize)
//! allocates (or clears, if already initialized); writes are only accepted in
//! `Writing`; reads outside the owned partition require `Synced`.

use std::sync::Arc;

use ndarray::{Array2, ArrayViewMut1};
use thiserror::Error;

use crate::assigner::ProcessAssigner;
use crate::comm::{CommError, Communicator};

/// Errors from distributed table access.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("Table '{0}' has not been initialized")]
    NotInitialized(String),

    #[error("Index ({row}, {col}) is outside the {rows}x{cols} table")]
    OutOfRange {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("{axis:?} {index} is not owned by this process")]
    NotOwned { axis: Axis, index: usize },

    #[error("Table is distributed along {0:?}; lane access along the other axis is not available")]
    WrongAxis(Axis),

    #[error("Table has been synchronized and is read-only until cleared")]
    ReadOnly,

    #[error("Table storage is not contiguous")]
    Layout,

    #[error("Communication failed during sync: {0}")]
    Comm(#[from] CommError),
}

/// Axis along which a table is partitioned over processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Row,
    Column,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Uninitialized,
    Writing,
    Synced,
}

/// A row- or column-partitioned table reconciled by an explicit sync.
///
/// Storage is lane-major: a lane is a row for [`Axis::Row`] and a column for
/// [`Axis::Column`], so every owned lane is contiguous in memory.
pub struct ParallelTable {
    label: String,
    axis: Axis,
    rows: usize,
    cols: usize,
    partition: Option<Arc<dyn ProcessAssigner>>,
    /// Owned lanes, shape (owned lanes, lane length).
    local: Array2<f64>,
    /// Every lane, shape (total lanes, lane length). Only allocated when the
    /// partition is distributed; a replicated partition is already complete
    /// in `local`.
    resident: Array2<f64>,
    state: TableState,
}

impl Default for ParallelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelTable {
    /// Create an empty, uninitialized table.
    pub fn new() -> Self {
        Self {
            label: String::new(),
            axis: Axis::Row,
            rows: 0,
            cols: 0,
            partition: None,
            local: Array2::zeros((0, 0)),
            resident: Array2::zeros((0, 0)),
            state: TableState::Uninitialized,
        }
    }

    /// Allocate storage for the caller's partition, or clear the table if it
    /// was initialized before.
    ///
    /// The table has `row_assigner.total()` rows and `col_assigner.total()`
    /// columns, partitioned along `axis` by the corresponding assigner.
    pub fn initialize(
        &mut self,
        label: impl Into<String>,
        row_assigner: Arc<dyn ProcessAssigner>,
        col_assigner: Arc<dyn ProcessAssigner>,
        axis: Axis,
    ) {
        if self.is_initialized() {
            self.clear();
            return;
        }

        self.label = label.into();
        self.axis = axis;
        self.rows = row_assigner.total();
        self.cols = col_assigner.total();
        let partition = match axis {
            Axis::Row => row_assigner,
            Axis::Column => col_assigner,
        };

        let (lanes, lane_len) = self.lane_shape();
        self.local = Array2::zeros((partition.count(), lane_len));
        self.resident = if partition.is_distributing() {
            Array2::zeros((lanes, lane_len))
        } else {
            Array2::zeros((0, 0))
        };
        self.partition = Some(partition);
        self.state = TableState::Writing;

        log::debug!(
            "Initialized table '{}' ({}x{}, {} local lanes along {:?})",
            self.label,
            self.rows,
            self.cols,
            self.local.nrows(),
            axis
        );
    }

    /// Zero every locally held value without reallocating.
    pub fn clear(&mut self) {
        self.local.fill(0.0);
        self.resident.fill(0.0);
        if self.is_initialized() {
            self.state = TableState::Writing;
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state != TableState::Uninitialized
    }

    pub fn is_synced(&self) -> bool {
        self.state == TableState::Synced
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// (total lanes, lane length) for the distribution axis.
    fn lane_shape(&self) -> (usize, usize) {
        match self.axis {
            Axis::Row => (self.rows, self.cols),
            Axis::Column => (self.cols, self.rows),
        }
    }

    fn partition(&self) -> Result<&dyn ProcessAssigner, TableError> {
        self.partition
            .as_deref()
            .ok_or_else(|| TableError::NotInitialized(self.label.clone()))
    }

    fn lane_mut(&mut self, axis: Axis, index: usize) -> Result<ArrayViewMut1<'_, f64>, TableError> {
        if self.axis != axis {
            return Err(TableError::WrongAxis(self.axis));
        }
        match self.state {
            TableState::Uninitialized => return Err(TableError::NotInitialized(self.label.clone())),
            TableState::Synced => return Err(TableError::ReadOnly),
            TableState::Writing => {}
        }
        let relative = self
            .partition()?
            .relative_index(index)
            .ok_or(TableError::NotOwned { axis, index })?;
        Ok(self.local.row_mut(relative))
    }

    /// Mutable access to row `m` of a row-partitioned table. Only rows owned
    /// by the calling process are writable.
    pub fn row_mut(&mut self, m: usize) -> Result<ArrayViewMut1<'_, f64>, TableError> {
        self.lane_mut(Axis::Row, m)
    }

    /// Mutable access to column `ell` of a column-partitioned table.
    pub fn column_mut(&mut self, ell: usize) -> Result<ArrayViewMut1<'_, f64>, TableError> {
        self.lane_mut(Axis::Column, ell)
    }

    /// Read the value at `(row, col)`.
    ///
    /// Before [`sync`](Self::sync) only owned lanes can be read; afterwards
    /// every index is readable on every process.
    pub fn value(&self, row: usize, col: usize) -> Result<f64, TableError> {
        let partition = self.partition()?;
        if row >= self.rows || col >= self.cols {
            return Err(TableError::OutOfRange {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        let (lane, pos) = match self.axis {
            Axis::Row => (row, col),
            Axis::Column => (col, row),
        };
        if self.is_synced() && partition.is_distributing() {
            return Ok(self.resident[[lane, pos]]);
        }
        let relative = partition.relative_index(lane).ok_or(TableError::NotOwned {
            axis: self.axis,
            index: lane,
        })?;
        Ok(self.local[[relative, pos]])
    }

    /// Reconcile the partitions of all processes. Collective.
    ///
    /// A distributed partition is exchanged with an all-to-all so that every
    /// process ends up with every lane. A replicated partition is combined by
    /// summation, so each value must have been written by at most one process.
    ///
    /// Relative indices are assumed to follow the increasing order of absolute
    /// indices, which holds for both assigner policies.
    pub fn sync(&mut self, comm: &dyn Communicator) -> Result<(), TableError> {
        let partition = self
            .partition
            .clone()
            .ok_or_else(|| TableError::NotInitialized(self.label.clone()))?;
        if self.is_synced() {
            return Err(TableError::ReadOnly);
        }

        let (lanes, lane_len) = self.lane_shape();
        if partition.is_distributing() {
            let size = comm.size();
            let own: Vec<usize> = (0..partition.count()).map(|r| r * lane_len).collect();
            let send_displacements = vec![own; size];

            let mut recv_displacements = vec![Vec::new(); size];
            for lane in 0..lanes {
                let owner = partition.rank_for_index(lane);
                let slot = recv_displacements
                    .get_mut(owner)
                    .ok_or(CommError::InvalidRank { rank: owner, size })?;
                slot.push(lane * lane_len);
            }

            let send = self.local.as_slice().ok_or(TableError::Layout)?;
            let recv = self.resident.as_slice_mut().ok_or(TableError::Layout)?;
            comm.all_to_all_irregular(send, &send_displacements, recv, &recv_displacements, lane_len)?;
        } else if comm.is_multi_proc() {
            let buffer = self.local.as_slice_mut().ok_or(TableError::Layout)?;
            comm.all_reduce_sum(buffer)?;
        }

        self.state = TableState::Synced;
        log::debug!("Synchronized table '{}' across {} processes", self.label, comm.size());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assigner::{IdenticalAssigner, StaggeredAssigner};
    use crate::serial::SerialCommunicator;

    fn identical(size: usize) -> Arc<dyn ProcessAssigner> {
        let mut assigner = IdenticalAssigner::new(0, 1).unwrap();
        assigner.assign(size, 1);
        Arc::new(assigner)
    }

    #[test]
    fn test_initialize_twice_clears() {
        let mut table = ParallelTable::new();
        table.initialize("t", identical(3), identical(2), Axis::Row);
        table.row_mut(1).unwrap()[0] = 4.0;
        assert_eq!(table.value(1, 0).unwrap(), 4.0);

        table.initialize("t", identical(3), identical(2), Axis::Row);
        assert_eq!(table.value(1, 0).unwrap(), 0.0);
        assert!(!table.is_synced());
    }

    #[test]
    fn test_uninitialized_table_rejects_access() {
        let mut table = ParallelTable::new();
        assert!(matches!(table.value(0, 0), Err(TableError::NotInitialized(_))));
        assert!(matches!(table.row_mut(0), Err(TableError::NotInitialized(_))));
    }

    #[test]
    fn test_column_partition_reads_back_transposed() {
        let comm = SerialCommunicator::new();
        let mut cols = StaggeredAssigner::new(0, 1).unwrap();
        cols.assign(3, 1);
        let mut table = ParallelTable::new();
        table.initialize("cols", identical(2), Arc::new(cols), Axis::Column);
        {
            let mut column = table.column_mut(2).unwrap();
            column[0] = 1.0;
            column[1] = 2.0;
        }
        assert!(matches!(table.row_mut(0), Err(TableError::WrongAxis(Axis::Column))));
        table.sync(&comm).unwrap();
        assert_eq!(table.value(0, 2).unwrap(), 1.0);
        assert_eq!(table.value(1, 2).unwrap(), 2.0);
        assert_eq!(table.value(1, 1).unwrap(), 0.0);
    }

    #[test]
    fn test_synced_table_is_read_only_until_cleared() {
        let comm = SerialCommunicator::new();
        let mut table = ParallelTable::new();
        table.initialize("t", identical(2), identical(2), Axis::Row);
        table.sync(&comm).unwrap();
        assert!(matches!(table.row_mut(0), Err(TableError::ReadOnly)));
        table.clear();
        assert!(table.row_mut(0).is_ok());
    }

    #[test]
    fn test_out_of_range_read() {
        let mut table = ParallelTable::new();
        table.initialize("t", identical(2), identical(2), Axis::Row);
        assert!(matches!(
            table.value(2, 0),
            Err(TableError::OutOfRange { row: 2, .. })
        ));
    }
}
