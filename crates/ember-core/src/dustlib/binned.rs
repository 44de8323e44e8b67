use ndarray::Zip;

use super::mapping::{LibraryMapping, Mapping};
use super::{agree_on_failure, DustLibError, EmissionContext};
use crate::system::PhysicsError;

/// Groups cells by radiation field strength into logarithmic bins.
///
/// The strength of a cell is $\sum_\ell J_\ell \Delta\lambda_\ell$. Bin edges
/// span the strongest and weakest field found anywhere in the ensemble, so
/// every process bins its cells on the same scale. Cells without field or
/// without dust are left out of the library.
#[derive(Debug, Clone, Copy)]
pub struct StrengthBinnedLibrary {
    entries: usize,
}

impl StrengthBinnedLibrary {
    pub fn new(entries: usize) -> Result<Self, DustLibError> {
        if entries == 0 {
            return Err(DustLibError::Configuration(
                "a strength-binned library needs at least one entry".into(),
            ));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    fn bin(&self, strength: f64, log_min: f64, log_max: f64) -> usize {
        if log_max <= log_min {
            return 0;
        }
        let x = (strength.ln() - log_min) / (log_max - log_min);
        ((x * self.entries as f64) as usize).min(self.entries - 1)
    }
}

impl LibraryMapping for StrengthBinnedLibrary {
    fn entry_count(&self, _ctx: &EmissionContext<'_>) -> Result<usize, DustLibError> {
        Ok(self.entries)
    }

    /// Collective: agrees on the strength range with a min and a max reduction.
    fn build_mapping(&self, ctx: &EmissionContext<'_>) -> Result<Mapping, DustLibError> {
        let local = local_strengths(ctx);
        let strengths = agree_on_failure(ctx.comm, local)?;

        let mut lo = [f64::INFINITY];
        let mut hi = [f64::NEG_INFINITY];
        for s in strengths.iter().flatten() {
            lo[0] = lo[0].min(*s);
            hi[0] = hi[0].max(*s);
        }
        ctx.comm.all_reduce_min(&mut lo)?;
        ctx.comm.all_reduce_max(&mut hi)?;
        if !lo[0].is_finite() {
            return Ok(vec![None; strengths.len()]);
        }

        let (log_min, log_max) = (lo[0].ln(), hi[0].ln());
        Ok(strengths
            .into_iter()
            .map(|s| s.map(|s| self.bin(s, log_min, log_max)))
            .collect())
    }
}

/// Field strength of every owned cell, or `None` for cells without field or
/// without dust.
fn local_strengths(ctx: &EmissionContext<'_>) -> Result<Vec<Option<f64>>, DustLibError> {
    let assigner = ctx.system.cell_assigner();
    let widths = ctx.grid.bin_widths();
    (0..assigner.count())
        .map(|r| -> Result<Option<f64>, DustLibError> {
            let m = assigner.absolute_index(r);
            let field = ctx.system.mean_intensity(m);
            if field.len() != widths.len() {
                return Err(PhysicsError::LengthMismatch {
                    what: "radiation field",
                    expected: widths.len(),
                    actual: field.len(),
                }
                .into());
            }
            let mut strength = 0.0;
            Zip::from(&field).and(&widths).for_each(|&j, &dl| strength += j * dl);
            let eligible = strength > 0.0 && strength.is_finite() && ctx.system.total_density(m) > 0.0;
            Ok(eligible.then_some(strength))
        })
        .collect()
}
