//! In-memory dust system with tabulated cell data.

use std::sync::Arc;

use ember_parallel::ProcessAssigner;
use ndarray::{Array1, Array2};

use crate::system::{DustMix, DustSystem, PhysicsError, WavelengthGrid};

/// Dust system whose per-cell radiation field and densities are given as
/// tables indexed by absolute cell index.
///
/// Every process may hold the full tables; only rows of cells owned by the
/// process (according to the cell assigner) are read by the dust library.
pub struct TabulatedDustSystem {
    assigner: Arc<dyn ProcessAssigner>,
    mixes: Vec<Box<dyn DustMix>>,
    /// Mean intensity, shape (cells, wavelengths).
    fields: Array2<f64>,
    /// Density, shape (cells, components).
    densities: Array2<f64>,
}

impl TabulatedDustSystem {
    /// The cell assigner must already be assigned over the cells. The field
    /// table and every mix must be sampled on `grid`.
    pub fn new(
        grid: &dyn WavelengthGrid,
        assigner: Arc<dyn ProcessAssigner>,
        mixes: Vec<Box<dyn DustMix>>,
        fields: Array2<f64>,
        densities: Array2<f64>,
    ) -> Result<Self, PhysicsError> {
        let cells = assigner.total();
        if fields.nrows() != cells {
            return Err(PhysicsError::LengthMismatch {
                what: "radiation field table",
                expected: cells,
                actual: fields.nrows(),
            });
        }
        if fields.ncols() != grid.len() {
            return Err(PhysicsError::LengthMismatch {
                what: "radiation field table",
                expected: cells * grid.len(),
                actual: fields.len(),
            });
        }
        if let Some(mix) = mixes.iter().find(|mix| mix.absorption_opacities().len() != grid.len()) {
            return Err(PhysicsError::InvalidParameter(format!(
                "mix '{}' has {} opacities for {} wavelength bins",
                mix.name(),
                mix.absorption_opacities().len(),
                grid.len()
            )));
        }
        if densities.dim() != (cells, mixes.len()) {
            return Err(PhysicsError::LengthMismatch {
                what: "density table",
                expected: cells * mixes.len(),
                actual: densities.len(),
            });
        }
        if densities.iter().any(|&rho| !rho.is_finite() || rho < 0.0) {
            return Err(PhysicsError::InvalidParameter(
                "densities must be finite and non-negative".into(),
            ));
        }
        Ok(Self {
            assigner,
            mixes,
            fields,
            densities,
        })
    }

    pub fn cell_count(&self) -> usize {
        self.fields.nrows()
    }
}

impl DustSystem for TabulatedDustSystem {
    fn cell_assigner(&self) -> Arc<dyn ProcessAssigner> {
        Arc::clone(&self.assigner)
    }

    fn component_count(&self) -> usize {
        self.mixes.len()
    }

    fn mix(&self, h: usize) -> &dyn DustMix {
        self.mixes[h].as_ref()
    }

    fn mean_intensity(&self, m: usize) -> Array1<f64> {
        self.fields.row(m).to_owned()
    }

    fn density(&self, m: usize, h: usize) -> f64 {
        self.densities[[m, h]]
    }
}
