//! Collaborator interfaces consumed by the dust library.
//!
//! The library engine does not own the physics: it reads the radiation field
//! and densities of the cells from a [`DustSystem`], evaluates emission through
//! a [`DustEmissivity`], and converts emissivities to luminosities on a
//! [`WavelengthGrid`]. Cell indices passed to these traits are always
//! *absolute* (shared by every process).

use std::sync::Arc;

use ember_parallel::ProcessAssigner;
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

/// Errors raised by physics collaborators.
#[derive(Debug, Error)]
pub enum PhysicsError {
    #[error("{what} has length {actual}, expected {expected}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),
}

/// Discretisation of the wavelength axis.
pub trait WavelengthGrid: Send + Sync {
    /// Number of wavelength bins.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Characteristic wavelength of each bin (m).
    fn wavelengths(&self) -> ArrayView1<'_, f64>;

    /// Width of each bin (m).
    fn bin_widths(&self) -> ArrayView1<'_, f64>;

    /// Assigner distributing the wavelength bins over the ensemble.
    fn assigner(&self) -> Arc<dyn ProcessAssigner>;
}

/// A population of dust grains with its own optical properties.
pub trait DustMix: Send + Sync {
    fn name(&self) -> &str;

    /// Absorption opacity κ_abs per wavelength bin (m² kg⁻¹).
    fn absorption_opacities(&self) -> ArrayView1<'_, f64>;
}

/// Computes the emission spectrum of a dust mix embedded in a radiation field.
pub trait DustEmissivity: Send + Sync {
    /// Emissivity per wavelength bin of `mix` exposed to the mean intensity
    /// `field`, per unit mass of dust.
    fn emissivity(&self, mix: &dyn DustMix, field: ArrayView1<'_, f64>) -> Result<Array1<f64>, PhysicsError>;

    /// Whether progress through the library should be logged.
    fn log_frequency(&self) -> bool {
        false
    }
}

/// The dust distributed over the spatial cells.
pub trait DustSystem: Send + Sync {
    /// Assigner distributing the cells over the ensemble.
    fn cell_assigner(&self) -> Arc<dyn ProcessAssigner>;

    /// Number of dust components.
    fn component_count(&self) -> usize;

    /// Dust mix of component `h`.
    fn mix(&self, h: usize) -> &dyn DustMix;

    /// Mean intensity of the radiation field in cell `m`, per wavelength bin.
    fn mean_intensity(&self, m: usize) -> Array1<f64>;

    /// Dust density of component `h` in cell `m` (kg m⁻³).
    fn density(&self, m: usize, h: usize) -> f64;

    /// Density summed over all components.
    fn total_density(&self, m: usize) -> f64 {
        (0..self.component_count()).map(|h| self.density(m, h)).sum()
    }
}
