//! Dust emission library.
//!
//! Computing an emission spectrum is expensive, and many cells of a model sit
//! in nearly the same radiation field. A [`DustLib`] groups cells into
//! *library entries* through a pluggable [`LibraryMapping`], evaluates the
//! emissivity once per entry against the mean field of its cells, and stores
//! a normalized luminosity vector for every cell in a [`ParallelTable`].
//!
//! # Work division
//!
//! When the communicator is data parallel the cells are distributed and every
//! process evaluates all entries of its own cells. Otherwise every process
//! holds every cell, the entries are divided over the processes, and the
//! replicated table is summed during sync.
//!
//! # Example
//!
//! ```no_run
//! # use ember_core::dustlib::{DustLib, EmissionContext};
//! # fn demo(ctx: &EmissionContext<'_>) -> Result<(), ember_core::dustlib::DustLibError> {
//! let mut library = DustLib::all_cells();
//! library.calculate(ctx)?;
//! let l = library.luminosity(0, 0)?;
//! # Ok(())
//! # }
//! ```

mod binned;
mod kernel;
mod mapping;

pub use binned::StrengthBinnedLibrary;
pub use mapping::{invert_mapping, AllCellsLibrary, InverseMapping, LibraryMapping, Mapping};

use ember_parallel::{assigned, AssignError, Axis, CommError, Communicator, ParallelTable, TableError};
use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::system::{DustEmissivity, DustSystem, PhysicsError, WavelengthGrid};
use kernel::EmissionCalculator;

/// Label of the luminosity table.
pub const TABLE_LABEL: &str = "Dust Emission";

/// Errors from building or querying a dust library.
#[derive(Debug, Error)]
pub enum DustLibError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid library mapping: {0}")]
    InvalidMapping(String),

    #[error("Dust emission has not been calculated")]
    NotCalculated,

    #[error("Another process of the ensemble failed; aborting")]
    EnsembleAborted,

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Assign(#[from] AssignError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Physics(#[from] PhysicsError),
}

/// Turn a local outcome into an ensemble-wide one. Collective.
///
/// Every process learns whether any process failed. A process that failed
/// keeps its own error; the others return [`DustLibError::EnsembleAborted`].
pub fn agree_on_failure<T>(
    comm: &dyn Communicator,
    local: Result<T, DustLibError>,
) -> Result<T, DustLibError> {
    let mut failed = local.is_err();
    comm.all_reduce_or(&mut failed)?;
    match local {
        Ok(_) if failed => Err(DustLibError::EnsembleAborted),
        local => local,
    }
}

/// Collaborators of one library calculation.
///
/// Every process of the ensemble builds its own context around its own
/// communicator.
#[derive(Clone, Copy)]
pub struct EmissionContext<'a> {
    pub comm: &'a dyn Communicator,
    pub system: &'a dyn DustSystem,
    pub emissivity: &'a dyn DustEmissivity,
    pub grid: &'a dyn WavelengthGrid,
}

impl<'a> EmissionContext<'a> {
    pub fn new(
        comm: &'a dyn Communicator,
        system: &'a dyn DustSystem,
        emissivity: &'a dyn DustEmissivity,
        grid: &'a dyn WavelengthGrid,
    ) -> Self {
        Self {
            comm,
            system,
            emissivity,
            grid,
        }
    }
}

/// Progress of a [`DustLib`] through one calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LibraryState {
    Uninitialized,
    Mapped,
    Computed,
    Synced,
}

/// Usage figures of the last calculation on this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    /// Entries the mapping policy asked for.
    pub entries: usize,
    /// Entries with at least one mapped cell.
    pub entries_in_use: usize,
    /// Cells owned by this process.
    pub local_cells: usize,
    /// Owned cells mapped to some entry.
    pub mapped_cells: usize,
}

/// Dust emission library over a cell-to-entry mapping policy.
pub struct DustLib {
    mapping: Box<dyn LibraryMapping>,
    table: ParallelTable,
    state: LibraryState,
    stats: LibraryStats,
}

impl DustLib {
    pub fn new(mapping: impl LibraryMapping + 'static) -> Self {
        Self {
            mapping: Box::new(mapping),
            table: ParallelTable::new(),
            state: LibraryState::Uninitialized,
            stats: LibraryStats::default(),
        }
    }

    /// Library with one entry per cell.
    pub fn all_cells() -> Self {
        Self::new(AllCellsLibrary)
    }

    /// Number of entries the mapping policy uses for `ctx`.
    pub fn entry_count(&self, ctx: &EmissionContext<'_>) -> Result<usize, DustLibError> {
        self.mapping.entry_count(ctx)
    }

    pub fn state(&self) -> LibraryState {
        self.state
    }

    pub fn stats(&self) -> LibraryStats {
        self.stats
    }

    pub fn table(&self) -> &ParallelTable {
        &self.table
    }

    fn check_configuration(ctx: &EmissionContext<'_>) -> Result<(), DustLibError> {
        let comm = ctx.comm;
        let distributing = ctx.system.cell_assigner().is_distributing();
        if comm.is_multi_proc() && comm.is_data_parallel() != distributing {
            return Err(DustLibError::Configuration(format!(
                "data parallel mode is {} but the cells are {}",
                if comm.is_data_parallel() { "on" } else { "off" },
                if distributing { "distributed" } else { "replicated" }
            )));
        }
        let bins = ctx.grid.assigner().total();
        if bins != ctx.grid.len() || ctx.grid.bin_widths().len() != ctx.grid.len() {
            return Err(DustLibError::Configuration(format!(
                "wavelength grid has {} bins but its assigner covers {}",
                ctx.grid.len(),
                bins
            )));
        }
        Ok(())
    }

    /// Compute the luminosity of every cell and make it available on every
    /// process. Collective; may be called again to recompute.
    ///
    /// A failure on any process fails the call on every process: the local
    /// phases end in a failure agreement, so no process is left waiting in a
    /// collective for one that already returned.
    pub fn calculate(&mut self, ctx: &EmissionContext<'_>) -> Result<(), DustLibError> {
        self.state = LibraryState::Uninitialized;
        let local = Self::check_configuration(ctx).and_then(|()| self.mapping.entry_count(ctx));
        let entries = agree_on_failure(ctx.comm, local)?;

        self.table.initialize(
            TABLE_LABEL,
            ctx.system.cell_assigner(),
            ctx.grid.assigner(),
            Axis::Row,
        );
        let local = self.compute_local(ctx, entries);
        agree_on_failure(ctx.comm, local)?;

        ctx.comm.barrier("the emission spectra calculation")?;
        self.table.sync(ctx.comm)?;
        self.state = LibraryState::Synced;
        Ok(())
    }

    /// Map the cells and write the luminosities of the entries this process
    /// owns into its partition of the table.
    fn compute_local(&mut self, ctx: &EmissionContext<'_>, entries: usize) -> Result<(), DustLibError> {
        let cell_assigner = ctx.system.cell_assigner();
        let mapping = self.mapping.build_mapping(ctx)?;
        let inverse = invert_mapping(&mapping, entries, cell_assigner.as_ref())?;
        self.stats = LibraryStats {
            entries,
            entries_in_use: inverse.iter().filter(|cells| !cells.is_empty()).count(),
            local_cells: cell_assigner.count(),
            mapped_cells: mapping.iter().flatten().count(),
        };
        self.state = LibraryState::Mapped;
        info!(
            "Library entries in use: {} out of {}.",
            self.stats.entries_in_use, entries
        );

        let work = assigned(!ctx.comm.is_data_parallel(), ctx.comm, entries, 1)?;
        let calculator = EmissionCalculator::new(ctx.system, ctx.emissivity, ctx.grid.bin_widths(), &inverse);
        for (m, lum) in calculator.run(work.as_ref())? {
            self.table.row_mut(m)?.assign(&lum);
        }
        self.state = LibraryState::Computed;
        Ok(())
    }

    /// Normalized luminosity of cell `m` in wavelength bin `ell`.
    pub fn luminosity(&self, m: usize, ell: usize) -> Result<f64, DustLibError> {
        if self.state != LibraryState::Synced {
            return Err(DustLibError::NotCalculated);
        }
        Ok(self.table.value(m, ell)?)
    }
}
