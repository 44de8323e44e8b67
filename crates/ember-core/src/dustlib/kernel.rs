//! Per-entry emission kernel.

use ember_parallel::ProcessAssigner;
use log::info;
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;

use super::mapping::InverseMapping;
use super::DustLibError;
use crate::progress::ProgressLimiter;
use crate::system::{DustEmissivity, DustSystem, PhysicsError};

/// Normalized luminosity vector of one absolute cell.
pub(crate) type CellLuminosity = (usize, Array1<f64>);

/// Evaluates the library entries assigned to this process.
///
/// Holds only thread-safe collaborators so that entries can be processed on
/// the Rayon pool; the communicator stays with the caller.
pub(crate) struct EmissionCalculator<'a> {
    system: &'a dyn DustSystem,
    emissivity: &'a dyn DustEmissivity,
    widths: ArrayView1<'a, f64>,
    inverse: &'a InverseMapping,
    limiter: ProgressLimiter,
}

impl<'a> EmissionCalculator<'a> {
    pub(crate) fn new(
        system: &'a dyn DustSystem,
        emissivity: &'a dyn DustEmissivity,
        widths: ArrayView1<'a, f64>,
        inverse: &'a InverseMapping,
    ) -> Self {
        Self {
            system,
            emissivity,
            widths,
            inverse,
            limiter: ProgressLimiter::default(),
        }
    }

    /// Luminosities of every cell mapped to entry `n`.
    fn body(&self, n: usize) -> Result<Vec<CellLuminosity>, DustLibError> {
        let cells = match self.inverse.get(n) {
            Some(cells) if !cells.is_empty() => cells,
            _ => return Ok(Vec::new()),
        };
        if self.emissivity.log_frequency() && self.limiter.ready() {
            info!("Calculating emission for library entry {}...", n + 1);
        }

        let bins = self.widths.len();
        let mut field = Array1::<f64>::zeros(bins);
        for &m in cells {
            let intensity = self.system.mean_intensity(m);
            if intensity.len() != bins {
                return Err(PhysicsError::LengthMismatch {
                    what: "radiation field",
                    expected: bins,
                    actual: intensity.len(),
                }
                .into());
            }
            field += &intensity;
        }
        field /= cells.len() as f64;

        let emissivities = (0..self.system.component_count())
            .map(|h| {
                let ev = self.emissivity.emissivity(self.system.mix(h), field.view())?;
                if ev.len() != bins {
                    return Err(PhysicsError::LengthMismatch {
                        what: "emissivity",
                        expected: bins,
                        actual: ev.len(),
                    });
                }
                Ok(ev)
            })
            .collect::<Result<Vec<_>, PhysicsError>>()?;

        Ok(cells
            .iter()
            .map(|&m| {
                let mut lum = Array1::<f64>::zeros(bins);
                for (h, ev) in emissivities.iter().enumerate() {
                    lum.scaled_add(self.system.density(m, h), ev);
                }
                lum *= &self.widths;
                let total = lum.sum();
                if total > 0.0 {
                    lum /= total;
                }
                (m, lum)
            })
            .collect())
    }

    /// Evaluate every entry of `work` owned by this process, in entry order.
    pub(crate) fn run(&self, work: &dyn ProcessAssigner) -> Result<Vec<CellLuminosity>, DustLibError> {
        let per_entry = (0..work.count())
            .into_par_iter()
            .map(|r| self.body(work.absolute_index(r)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(per_entry.into_iter().flatten().collect())
    }
}
