//! # Ember Parallel
//!
//! Process-ensemble plumbing for the Ember framework. This crate provides a
//! [`Communicator`](comm::Communicator) trait of collective operations,
//! [`ProcessAssigner`](assigner::ProcessAssigner) policies that divide work
//! over the ensemble, and the [`ParallelTable`](table::ParallelTable) that
//! reconciles process-local results.
//!
//! ## Available communicators
//!
//! | Communicator | Feature flag | Ensemble |
//! |--------------|-------------|----------|
//! | [`SerialCommunicator`] | always | one process |
//! | [`ThreadCommunicator`] | always | ranks on threads of one process |
//! | `MpiCommunicator` | `distributed` | MPI world |

pub mod assigner;
pub mod comm;
pub mod serial;
pub mod table;
pub mod threaded;

#[cfg(feature = "distributed")]
pub mod cluster;

pub use assigner::{assigned, AssignError, IdenticalAssigner, ProcessAssigner, StaggeredAssigner};
pub use comm::{CommError, Communicator};
pub use serial::SerialCommunicator;
pub use table::{Axis, ParallelTable, TableError};
pub use threaded::ThreadCommunicator;

#[cfg(feature = "distributed")]
pub use cluster::MpiCommunicator;
