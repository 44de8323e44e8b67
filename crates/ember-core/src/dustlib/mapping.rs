//! Cell-to-entry mapping policies.

use ember_parallel::ProcessAssigner;

use super::{DustLibError, EmissionContext};

/// Library entry of each process-local cell, or `None` for cells that do not
/// emit.
pub type Mapping = Vec<Option<usize>>;

/// Entry → absolute indices of the cells mapped to it, in increasing order.
pub type InverseMapping = Vec<Vec<usize>>;

/// Decides how cells are grouped into shared library entries.
pub trait LibraryMapping: Send + Sync {
    /// Number of library entries for the current cell configuration.
    fn entry_count(&self, ctx: &EmissionContext<'_>) -> Result<usize, DustLibError>;

    /// Entry for every cell owned by this process, indexed by the cell's
    /// relative index. May use collectives, in which case every process must
    /// call it.
    fn build_mapping(&self, ctx: &EmissionContext<'_>) -> Result<Mapping, DustLibError>;
}

/// One library entry per cell: the identity mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllCellsLibrary;

impl LibraryMapping for AllCellsLibrary {
    fn entry_count(&self, ctx: &EmissionContext<'_>) -> Result<usize, DustLibError> {
        Ok(ctx.system.cell_assigner().count())
    }

    fn build_mapping(&self, ctx: &EmissionContext<'_>) -> Result<Mapping, DustLibError> {
        let cells = ctx.system.cell_assigner().count();
        Ok((0..cells).map(Some).collect())
    }
}

/// Invert a process-local mapping into entry → absolute cell indices.
pub fn invert_mapping(
    mapping: &[Option<usize>],
    entries: usize,
    cell_assigner: &dyn ProcessAssigner,
) -> Result<InverseMapping, DustLibError> {
    if mapping.len() != cell_assigner.count() {
        return Err(DustLibError::InvalidMapping(format!(
            "mapping covers {} cells but this process owns {}",
            mapping.len(),
            cell_assigner.count()
        )));
    }
    let mut inverse = vec![Vec::new(); entries];
    for (relative, entry) in mapping.iter().enumerate() {
        let Some(entry) = *entry else { continue };
        let cell = cell_assigner.absolute_index(relative);
        inverse
            .get_mut(entry)
            .ok_or_else(|| {
                DustLibError::InvalidMapping(format!(
                    "cell {} maps to entry {} but the library has {} entries",
                    cell, entry, entries
                ))
            })?
            .push(cell);
    }
    Ok(inverse)
}
