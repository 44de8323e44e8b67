//! Job runner: builds the shell model, runs the dust library on the selected
//! process ensemble, and writes the results.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ndarray::Array2;
use serde::Serialize;

use ember_core::emissivity::{planck, GreyBodyEmissivity};
use ember_core::grid::TabulatedWavelengthGrid;
use ember_core::medium::TabulatedDustSystem;
use ember_core::mix::PowerLawMix;
use ember_core::{DustLib, DustMix, DustSystem, EmissionContext, LibraryStats, StrengthBinnedLibrary, WavelengthGrid};
use ember_parallel::{
    assigned, Communicator, IdenticalAssigner, ProcessAssigner, SerialCommunicator, ThreadCommunicator,
};

use crate::config::{BackendKind, JobConfig, LibraryKind, ModelConfig};

const MICRON: f64 = 1e-6;
/// Solar radius in AU.
const SOLAR_RADIUS_AU: f64 = 4.650_467e-3;

/// Normalized emission spectrum of one cell.
#[derive(Debug, Clone, Serialize)]
pub struct CellSpectrum {
    pub cell: usize,
    pub radius_au: f64,
    pub total_density: f64,
    pub luminosity: Vec<f64>,
}

/// Results of a run, assembled on the root process.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationOutput {
    pub ranks: usize,
    pub wavelengths_micron: Vec<f64>,
    /// Library usage on the root process.
    pub stats: LibraryStats,
    pub cells: Vec<CellSpectrum>,
}

/// Run a job on the backend it names. Returns the output on the root
/// process and `None` elsewhere.
pub fn run_simulation(job: &JobConfig, ranks: usize) -> Result<Option<SimulationOutput>> {
    let data_parallel = job.parallel.data_parallel;
    match job.parallel.backend {
        BackendKind::Serial => {
            println!("Backend: serial");
            run_rank(job, &SerialCommunicator::with_data_parallel(data_parallel))
        }
        BackendKind::Threads => run_threads(job, ranks),
        BackendKind::Mpi => run_mpi(job),
    }
}

fn mode(data_parallel: bool) -> &'static str {
    if data_parallel {
        "data parallel"
    } else {
        "task parallel"
    }
}

fn run_threads(job: &JobConfig, ranks: usize) -> Result<Option<SimulationOutput>> {
    println!("Backend: {} threads ({})", ranks, mode(job.parallel.data_parallel));
    let comms = ThreadCommunicator::ensemble(ranks, job.parallel.data_parallel)?;
    let outputs = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| scope.spawn(move || run_rank(job, comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("rank thread panicked")),
            })
            .collect::<Result<Vec<_>>>()
    })?;
    Ok(outputs.into_iter().flatten().next())
}

#[cfg(feature = "distributed")]
fn run_mpi(job: &JobConfig) -> Result<Option<SimulationOutput>> {
    let comm = ember_parallel::MpiCommunicator::initialize(job.parallel.data_parallel)?;
    if comm.is_root() {
        println!("Backend: MPI, {} processes ({})", comm.size(), mode(comm.is_data_parallel()));
    }
    run_rank(job, &comm)
}

#[cfg(not(feature = "distributed"))]
fn run_mpi(_job: &JobConfig) -> Result<Option<SimulationOutput>> {
    anyhow::bail!("MPI backend requested but binary was built without --features distributed")
}

/// Cell radii, logarithmically spaced between the shell borders.
fn shell_radii(model: &ModelConfig) -> Vec<f64> {
    let ratio = model.outer_radius / model.inner_radius;
    (0..model.cells)
        .map(|m| model.inner_radius * ratio.powf((m as f64 + 0.5) / model.cells as f64))
        .collect()
}

fn build_system(
    model: &ModelConfig,
    grid: &TabulatedWavelengthGrid,
    cells: Arc<dyn ProcessAssigner>,
    radii: &[f64],
) -> Result<TabulatedDustSystem> {
    let mixes = model
        .component
        .iter()
        .map(|c| -> Result<Box<dyn DustMix>> {
            let mix = PowerLawMix::new(c.name.as_str(), grid, c.kappa_ref, c.lambda_ref * MICRON, c.beta)
                .with_context(|| format!("component '{}'", c.name))?;
            Ok(Box::new(mix) as Box<dyn DustMix>)
        })
        .collect::<Result<Vec<_>>>()?;

    // Dilution of the stellar field at radius r: W = (R*/r)² / 4
    let star_radius = model.star_radius * SOLAR_RADIUS_AU;
    let stellar = grid.wavelengths().mapv(|lambda| planck(lambda, model.star_temperature));
    let fields = Array2::from_shape_fn((radii.len(), grid.len()), |(m, ell)| {
        0.25 * (star_radius / radii[m]).powi(2) * stellar[ell]
    });
    let densities = Array2::from_shape_fn((radii.len(), model.component.len()), |(m, h)| {
        model.component[h].density * (radii[m] / model.inner_radius).powf(-model.density_exponent)
    });
    Ok(TabulatedDustSystem::new(grid, cells, mixes, fields, densities)?)
}

/// Everything one process does for a run. Collective over `comm`.
fn run_rank(job: &JobConfig, comm: &dyn Communicator) -> Result<Option<SimulationOutput>> {
    let [lo, hi] = job.wavelengths.range;
    let grid = TabulatedWavelengthGrid::logarithmic(
        lo * MICRON,
        hi * MICRON,
        job.wavelengths.points,
        IdenticalAssigner::for_comm(comm)?,
    )?;
    let cells: Arc<dyn ProcessAssigner> =
        Arc::from(assigned(comm.is_data_parallel(), comm, job.model.cells, 1)?);
    let radii = shell_radii(&job.model);
    let system = build_system(&job.model, &grid, cells, &radii)?;
    let emissivity = GreyBodyEmissivity::new(&grid).with_log_frequency(job.library.log_progress);
    let ctx = EmissionContext::new(comm, &system, &emissivity, &grid);

    let mut library = match job.library.kind {
        LibraryKind::AllCells => DustLib::all_cells(),
        LibraryKind::StrengthBinned => DustLib::new(StrengthBinnedLibrary::new(job.library.entries)?),
    };
    library.calculate(&ctx).context("calculating dust emission")?;

    if !comm.is_root() {
        return Ok(None);
    }
    let stats = library.stats();
    println!(
        "  Library: {} of {} entries in use, {} of {} local cells mapped",
        stats.entries_in_use, stats.entries, stats.mapped_cells, stats.local_cells
    );

    let spectra = radii
        .iter()
        .enumerate()
        .map(|(m, &radius_au)| -> Result<CellSpectrum> {
            let luminosity = (0..grid.len())
                .map(|ell| library.luminosity(m, ell))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CellSpectrum {
                cell: m,
                radius_au,
                total_density: system.total_density(m),
                luminosity,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(SimulationOutput {
        ranks: comm.size(),
        wavelengths_micron: grid.wavelengths().iter().map(|l| l / MICRON).collect(),
        stats,
        cells: spectra,
    }))
}

/// Write cell luminosities to a CSV file with a metadata header.
pub fn write_luminosity_csv(output: &SimulationOutput, path: &Path, job: &JobConfig) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);

    // Metadata header
    writeln!(file, "# Ember dust emission: normalized cell luminosities")?;
    writeln!(file, "# Version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(
        file,
        "# ranks: {}, data_parallel: {}, library: {:?}",
        output.ranks, job.parallel.data_parallel, job.library.kind
    )?;
    writeln!(
        file,
        "# star: T={} K, R={} Rsun; shell: {}-{} AU, {} cells",
        job.model.star_temperature,
        job.model.star_radius,
        job.model.inner_radius,
        job.model.outer_radius,
        job.model.cells
    )?;
    for c in &job.model.component {
        writeln!(
            file,
            "# component '{}': kappa_ref={} m2/kg at {} um, beta={}, density={} kg/m3",
            c.name, c.kappa_ref, c.lambda_ref, c.beta, c.density
        )?;
    }
    writeln!(
        file,
        "# library entries in use: {} of {}",
        output.stats.entries_in_use, output.stats.entries
    )?;
    writeln!(file, "#")?;

    write!(file, "cell,radius_au,total_density")?;
    for lambda in &output.wavelengths_micron {
        write!(file, ",L_{:.4e}um", lambda)?;
    }
    writeln!(file)?;

    for cell in &output.cells {
        write!(file, "{},{:.6e},{:.6e}", cell.cell, cell.radius_au, cell.total_density)?;
        for l in &cell.luminosity {
            write!(file, ",{:.6e}", l)?;
        }
        writeln!(file)?;
    }
    file.flush()?;

    println!("Luminosities written to: {}", path.display());
    Ok(())
}

/// Write the full output to a JSON file.
pub fn write_luminosity_json(output: &SimulationOutput, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(output).context("JSON serialisation")?;
    std::fs::write(path, json)?;

    println!("Luminosities (JSON) written to: {}", path.display());
    Ok(())
}
