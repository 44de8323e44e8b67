//! Tabulated wavelength grids.

use std::sync::Arc;

use ember_parallel::ProcessAssigner;
use ndarray::{Array1, ArrayView1};

use crate::system::{PhysicsError, WavelengthGrid};

/// A wavelength grid given by explicit wavelengths and bin widths.
pub struct TabulatedWavelengthGrid {
    wavelengths: Array1<f64>,
    widths: Array1<f64>,
    assigner: Arc<dyn ProcessAssigner>,
}

impl TabulatedWavelengthGrid {
    /// Construct from wavelengths and bin widths (both in m).
    ///
    /// The assigner is assigned over the wavelength bins here.
    pub fn new(
        wavelengths: Array1<f64>,
        widths: Array1<f64>,
        mut assigner: impl ProcessAssigner + 'static,
    ) -> Result<Self, PhysicsError> {
        if widths.len() != wavelengths.len() {
            return Err(PhysicsError::LengthMismatch {
                what: "bin widths",
                expected: wavelengths.len(),
                actual: widths.len(),
            });
        }
        if wavelengths.is_empty() {
            return Err(PhysicsError::InvalidParameter(
                "wavelength grid needs at least one bin".into(),
            ));
        }
        if wavelengths.iter().chain(widths.iter()).any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(PhysicsError::InvalidParameter(
                "wavelengths and bin widths must be positive and finite".into(),
            ));
        }
        assigner.assign(wavelengths.len(), 1);
        Ok(Self {
            wavelengths,
            widths,
            assigner: Arc::new(assigner),
        })
    }

    /// Construct from wavelengths only, deriving the bin widths.
    ///
    /// Inner bin borders lie at the geometric mean of neighbouring wavelengths;
    /// the outer borders coincide with the first and last wavelength.
    pub fn from_wavelengths(
        wavelengths: Array1<f64>,
        assigner: impl ProcessAssigner + 'static,
    ) -> Result<Self, PhysicsError> {
        let n = wavelengths.len();
        if n < 2 {
            return Err(PhysicsError::InvalidParameter(
                "bin widths can only be derived for two or more wavelengths".into(),
            ));
        }
        for i in 1..n {
            if wavelengths[i] <= wavelengths[i - 1] || wavelengths[i - 1] <= 0.0 {
                return Err(PhysicsError::InvalidParameter(format!(
                    "wavelengths must be positive and strictly increasing at index {}",
                    i
                )));
            }
        }

        let mut borders = Vec::with_capacity(n + 1);
        borders.push(wavelengths[0]);
        for i in 1..n {
            borders.push((wavelengths[i - 1] * wavelengths[i]).sqrt());
        }
        borders.push(wavelengths[n - 1]);
        let widths: Array1<f64> = borders.windows(2).map(|w| w[1] - w[0]).collect();

        Self::new(wavelengths, widths, assigner)
    }

    /// Logarithmically spaced grid of `n` points from `min` to `max` (m).
    pub fn logarithmic(
        min: f64,
        max: f64,
        n: usize,
        assigner: impl ProcessAssigner + 'static,
    ) -> Result<Self, PhysicsError> {
        if !(min > 0.0 && max > min) {
            return Err(PhysicsError::InvalidParameter(format!(
                "logarithmic grid needs 0 < min < max, got [{}, {}]",
                min, max
            )));
        }
        let log_min = min.ln();
        let step = (max.ln() - log_min) / (n.max(2) - 1) as f64;
        let wavelengths: Array1<f64> = (0..n).map(|i| (log_min + step * i as f64).exp()).collect();
        Self::from_wavelengths(wavelengths, assigner)
    }
}

impl WavelengthGrid for TabulatedWavelengthGrid {
    fn len(&self) -> usize {
        self.wavelengths.len()
    }

    fn wavelengths(&self) -> ArrayView1<'_, f64> {
        self.wavelengths.view()
    }

    fn bin_widths(&self) -> ArrayView1<'_, f64> {
        self.widths.view()
    }

    fn assigner(&self) -> Arc<dyn ProcessAssigner> {
        Arc::clone(&self.assigner)
    }
}
