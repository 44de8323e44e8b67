//! TOML configuration deserialisation for emission jobs.

use anyhow::{bail, Context};
use serde::Deserialize;

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub wavelengths: WavelengthConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Logarithmic wavelength grid.
#[derive(Debug, Deserialize)]
pub struct WavelengthConfig {
    /// Shortest and longest wavelength in micron.
    pub range: [f64; 2],
    pub points: usize,
}

/// Spherical shell heated by a central star.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    pub cells: usize,
    /// Inner shell radius in AU.
    pub inner_radius: f64,
    /// Outer shell radius in AU.
    pub outer_radius: f64,
    /// Stellar effective temperature in K.
    #[serde(default = "default_star_temperature")]
    pub star_temperature: f64,
    /// Stellar radius in solar radii.
    #[serde(default = "default_star_radius")]
    pub star_radius: f64,
    /// Density falls off as r^-density_exponent.
    #[serde(default = "default_density_exponent")]
    pub density_exponent: f64,
    pub component: Vec<ComponentConfig>,
}

fn default_star_temperature() -> f64 {
    5800.0
}
fn default_star_radius() -> f64 {
    1.0
}
fn default_density_exponent() -> f64 {
    2.0
}

/// One dust component with a power-law opacity.
#[derive(Debug, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    /// Opacity at `lambda_ref` in m² kg⁻¹.
    pub kappa_ref: f64,
    /// Reference wavelength in micron.
    #[serde(default = "default_lambda_ref")]
    pub lambda_ref: f64,
    pub beta: f64,
    /// Density at the inner radius in kg m⁻³.
    pub density: f64,
}

fn default_lambda_ref() -> f64 {
    1.0
}

/// Mapping policy of the dust library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LibraryKind {
    AllCells,
    StrengthBinned,
}

#[derive(Debug, Deserialize)]
pub struct LibraryConfig {
    #[serde(default = "default_library_kind")]
    pub kind: LibraryKind,
    /// Number of entries of a strength-binned library.
    #[serde(default = "default_entries")]
    pub entries: usize,
    /// Log progress through the library entries.
    #[serde(default)]
    pub log_progress: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            kind: default_library_kind(),
            entries: default_entries(),
            log_progress: false,
        }
    }
}

fn default_library_kind() -> LibraryKind {
    LibraryKind::AllCells
}
fn default_entries() -> usize {
    64
}

/// Process ensemble the job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Serial,
    Threads,
    Mpi,
}

#[derive(Debug, Deserialize)]
pub struct ParallelConfig {
    /// Number of ranks of a thread ensemble.
    #[serde(default = "default_ranks")]
    pub ranks: usize,
    /// Distribute cells (true) or library entries (false) over the ranks.
    #[serde(default = "default_true")]
    pub data_parallel: bool,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            ranks: default_ranks(),
            data_parallel: true,
            backend: default_backend(),
        }
    }
}

fn default_ranks() -> usize {
    1
}
fn default_backend() -> BackendKind {
    BackendKind::Threads
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Whether to save luminosities as CSV (default: true).
    #[serde(default = "default_true")]
    pub save_csv: bool,
    /// Whether to also save luminosities as JSON (default: false).
    #[serde(default)]
    pub save_json: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            save_csv: true,
            save_json: false,
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}
fn default_true() -> bool {
    true
}

impl JobConfig {
    /// Reject configurations that would fail halfway through a run.
    pub fn validate(&self) -> anyhow::Result<()> {
        let [lo, hi] = self.wavelengths.range;
        if !(lo > 0.0 && hi > lo) {
            bail!("wavelength range must satisfy 0 < min < max, got [{}, {}]", lo, hi);
        }
        if self.wavelengths.points < 2 {
            bail!("wavelength grid needs at least 2 points");
        }
        let model = &self.model;
        if model.cells == 0 {
            bail!("model needs at least one cell");
        }
        if !(model.inner_radius > 0.0 && model.outer_radius >= model.inner_radius) {
            bail!(
                "model radii must satisfy 0 < inner_radius <= outer_radius, got {} and {}",
                model.inner_radius,
                model.outer_radius
            );
        }
        if !(model.star_temperature > 0.0 && model.star_radius > 0.0) {
            bail!("star temperature and radius must be positive");
        }
        if model.component.is_empty() {
            bail!("model needs at least one [[model.component]]");
        }
        for component in &model.component {
            if component.density < 0.0 {
                bail!("component '{}' has a negative density", component.name);
            }
        }
        if self.library.kind == LibraryKind::StrengthBinned && self.library.entries == 0 {
            bail!("a strength-binned library needs entries > 0");
        }
        if self.parallel.ranks == 0 {
            bail!("parallel.ranks must be at least 1");
        }
        Ok(())
    }
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<JobConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: JobConfig =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
