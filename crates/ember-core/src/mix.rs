//! Parametric dust mixes.

use ndarray::{Array1, ArrayView1};

use crate::system::{DustMix, PhysicsError, WavelengthGrid};

/// Dust mix with a power-law absorption opacity
/// $\kappa(\lambda) = \kappa_{\text{ref}} (\lambda / \lambda_{\text{ref}})^{-\beta}$,
/// sampled on a wavelength grid.
#[derive(Debug, Clone)]
pub struct PowerLawMix {
    name: String,
    opacities: Array1<f64>,
}

impl PowerLawMix {
    /// # Arguments
    /// * `kappa_ref` - Opacity at the reference wavelength (m² kg⁻¹).
    /// * `lambda_ref` - Reference wavelength (m).
    /// * `beta` - Spectral index of the opacity.
    pub fn new(
        name: impl Into<String>,
        grid: &dyn WavelengthGrid,
        kappa_ref: f64,
        lambda_ref: f64,
        beta: f64,
    ) -> Result<Self, PhysicsError> {
        if !(kappa_ref > 0.0 && lambda_ref > 0.0) || !beta.is_finite() {
            return Err(PhysicsError::InvalidParameter(format!(
                "power-law mix needs kappa_ref > 0 and lambda_ref > 0, got {} and {}",
                kappa_ref, lambda_ref
            )));
        }
        let opacities = grid
            .wavelengths()
            .mapv(|lambda| kappa_ref * (lambda / lambda_ref).powf(-beta));
        Ok(Self {
            name: name.into(),
            opacities,
        })
    }
}

impl DustMix for PowerLawMix {
    fn name(&self) -> &str {
        &self.name
    }

    fn absorption_opacities(&self) -> ArrayView1<'_, f64> {
        self.opacities.view()
    }
}
