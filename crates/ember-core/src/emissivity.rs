//! Thermal emission of dust grains in radiative equilibrium.
//!
//! [`GreyBodyEmissivity`] assumes every grain of a mix reaches a single
//! equilibrium temperature $T$ at which the absorbed and emitted power balance:
//!
//! $$\sum_\ell \kappa_\ell J_\ell \Delta\lambda_\ell = \sum_\ell \kappa_\ell B_\lambda(\lambda_\ell, T) \Delta\lambda_\ell$$
//!
//! and then emits $\kappa_\ell B_\lambda(\lambda_\ell, T)$.

use ndarray::{Array1, ArrayView1, Zip};

use crate::system::{DustEmissivity, DustMix, PhysicsError, WavelengthGrid};

/// Planck constant (J s).
const H: f64 = 6.626_070_15e-34;
/// Speed of light (m s⁻¹).
const C: f64 = 2.997_924_58e8;
/// Boltzmann constant (J K⁻¹).
const K_B: f64 = 1.380_649e-23;

const T_MIN: f64 = 1.0;
const T_MAX: f64 = 1.0e5;
const BISECTION_STEPS: usize = 100;

/// Planck spectral radiance $B_\lambda(T)$ (W m⁻³ sr⁻¹).
pub fn planck(lambda: f64, temperature: f64) -> f64 {
    let x = H * C / (lambda * K_B * temperature);
    // exp(x) overflows past ~709; the radiance is zero to double precision long before
    if x > 700.0 {
        return 0.0;
    }
    2.0 * H * C * C / lambda.powi(5) / x.exp_m1()
}

/// Equilibrium (grey-body) emissivity on a fixed wavelength grid.
pub struct GreyBodyEmissivity {
    wavelengths: Array1<f64>,
    widths: Array1<f64>,
    log_frequency: bool,
}

impl GreyBodyEmissivity {
    pub fn new(grid: &dyn WavelengthGrid) -> Self {
        Self {
            wavelengths: grid.wavelengths().to_owned(),
            widths: grid.bin_widths().to_owned(),
            log_frequency: false,
        }
    }

    /// Enable or disable progress logging through the library.
    pub fn with_log_frequency(mut self, log_frequency: bool) -> Self {
        self.log_frequency = log_frequency;
        self
    }

    fn emitted_power(&self, kappa: ArrayView1<'_, f64>, temperature: f64) -> f64 {
        let mut power = 0.0;
        Zip::from(kappa)
            .and(&self.wavelengths)
            .and(&self.widths)
            .for_each(|&k, &lambda, &dl| power += k * planck(lambda, temperature) * dl);
        power
    }

    /// Temperature at which a grain of opacity `kappa` emits `absorbed`.
    ///
    /// Bisection in log T; clamped to the search interval.
    pub fn equilibrium_temperature(&self, kappa: ArrayView1<'_, f64>, absorbed: f64) -> f64 {
        let (mut lo, mut hi) = (T_MIN.ln(), T_MAX.ln());
        if self.emitted_power(kappa, T_MAX) <= absorbed {
            return T_MAX;
        }
        if self.emitted_power(kappa, T_MIN) >= absorbed {
            return T_MIN;
        }
        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            if self.emitted_power(kappa, mid.exp()) < absorbed {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1e-12 {
                break;
            }
        }
        (0.5 * (lo + hi)).exp()
    }
}

impl DustEmissivity for GreyBodyEmissivity {
    fn emissivity(&self, mix: &dyn DustMix, field: ArrayView1<'_, f64>) -> Result<Array1<f64>, PhysicsError> {
        let kappa = mix.absorption_opacities();
        let n = self.wavelengths.len();
        if kappa.len() != n {
            return Err(PhysicsError::LengthMismatch {
                what: "absorption opacities",
                expected: n,
                actual: kappa.len(),
            });
        }
        if field.len() != n {
            return Err(PhysicsError::LengthMismatch {
                what: "radiation field",
                expected: n,
                actual: field.len(),
            });
        }
        if field.iter().any(|j| !j.is_finite()) {
            return Err(PhysicsError::NonFinite("radiation field"));
        }

        let absorbed = (&kappa * &field * &self.widths).sum();
        if absorbed <= 0.0 {
            return Ok(Array1::zeros(n));
        }
        let temperature = self.equilibrium_temperature(kappa, absorbed);
        Ok(Zip::from(kappa)
            .and(&self.wavelengths)
            .map_collect(|&k, &lambda| k * planck(lambda, temperature)))
    }

    fn log_frequency(&self) -> bool {
        self.log_frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::TabulatedWavelengthGrid;
    use crate::mix::PowerLawMix;
    use approx::assert_relative_eq;
    use ember_parallel::IdenticalAssigner;

    fn grid() -> TabulatedWavelengthGrid {
        TabulatedWavelengthGrid::logarithmic(1e-7, 1e-2, 200, IdenticalAssigner::new(0, 1).unwrap()).unwrap()
    }

    #[test]
    fn test_planck_peak_follows_wien() {
        // Wien displacement: λ_max T ≈ 2.898e-3 m K
        let temperature = 5800.0;
        let peak = 2.897_771_955e-3 / temperature;
        assert!(planck(peak, temperature) > planck(0.9 * peak, temperature));
        assert!(planck(peak, temperature) > planck(1.1 * peak, temperature));
        assert_eq!(planck(1e-9, 1.0), 0.0);
    }

    #[test]
    fn test_emission_balances_absorption() {
        let grid = grid();
        let mix = PowerLawMix::new("grey", &grid, 1.0, 1e-6, 0.0).unwrap();
        let emissivity = GreyBodyEmissivity::new(&grid);
        let field = grid.wavelengths().mapv(|lambda| 1e-10 * planck(lambda, 5800.0));

        let emitted = emissivity.emissivity(&mix, field.view()).unwrap();
        let absorbed = (&mix.absorption_opacities() * &field * &grid.bin_widths()).sum();
        let radiated = (&emitted * &grid.bin_widths()).sum();
        assert_relative_eq!(radiated, absorbed, max_relative = 1e-6);
    }

    #[test]
    fn test_dark_cell_emits_nothing() {
        let grid = grid();
        let mix = PowerLawMix::new("silicate", &grid, 1.0, 1e-6, 2.0).unwrap();
        let emissivity = GreyBodyEmissivity::new(&grid);
        let emitted = emissivity
            .emissivity(&mix, Array1::zeros(grid.len()).view())
            .unwrap();
        assert!(emitted.iter().all(|&e| e == 0.0));
    }

    #[test]
    fn test_field_length_is_checked() {
        let grid = grid();
        let mix = PowerLawMix::new("silicate", &grid, 1.0, 1e-6, 2.0).unwrap();
        let emissivity = GreyBodyEmissivity::new(&grid);
        let err = emissivity.emissivity(&mix, Array1::zeros(3).view()).unwrap_err();
        assert!(matches!(err, PhysicsError::LengthMismatch { actual: 3, .. }));
    }
}
