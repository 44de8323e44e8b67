//! End-to-end behaviour of the dust library on serial and threaded ensembles.

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use approx::assert_relative_eq;
use ember_core::dustlib::{invert_mapping, Mapping};
use ember_core::emissivity::{planck, GreyBodyEmissivity};
use ember_core::grid::TabulatedWavelengthGrid;
use ember_core::medium::TabulatedDustSystem;
use ember_core::mix::PowerLawMix;
use ember_core::{
    AllCellsLibrary, DustEmissivity, DustLib, DustLibError, DustMix, DustSystem, EmissionContext,
    LibraryMapping, LibraryState, PhysicsError, StrengthBinnedLibrary, WavelengthGrid,
};
use ember_parallel::{
    assigned, Communicator, IdenticalAssigner, ProcessAssigner, SerialCommunicator,
    StaggeredAssigner, ThreadCommunicator,
};
use ndarray::{array, s, Array1, Array2, ArrayView1};

const CELLS: usize = 9;
const BINS: usize = 24;

/// Returns a fixed spectrum per mix and records every evaluation.
struct RecordingEmissivity {
    spectrum: Array1<f64>,
    per_mix: Vec<(&'static str, Array1<f64>)>,
    log_frequency: bool,
    calls: Mutex<Vec<(String, Vec<f64>)>>,
}

impl RecordingEmissivity {
    fn new(spectrum: Array1<f64>) -> Self {
        Self {
            spectrum,
            per_mix: Vec::new(),
            log_frequency: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_mix(mut self, name: &'static str, spectrum: Array1<f64>) -> Self {
        self.per_mix.push((name, spectrum));
        self
    }

    fn with_log_frequency(mut self, log_frequency: bool) -> Self {
        self.log_frequency = log_frequency;
        self
    }

    fn fields(&self) -> Vec<Vec<f64>> {
        self.calls.lock().unwrap().iter().map(|(_, field)| field.clone()).collect()
    }

    fn mixes(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }
}

impl DustEmissivity for RecordingEmissivity {
    fn emissivity(&self, mix: &dyn DustMix, field: ArrayView1<'_, f64>) -> Result<Array1<f64>, PhysicsError> {
        self.calls.lock().unwrap().push((mix.name().to_string(), field.to_vec()));
        let spectrum = self
            .per_mix
            .iter()
            .find(|(name, _)| *name == mix.name())
            .map_or(&self.spectrum, |(_, spectrum)| spectrum);
        Ok(spectrum.clone())
    }

    fn log_frequency(&self) -> bool {
        self.log_frequency
    }
}

/// Tabulated system that reports a truncated radiation field for one cell.
struct TruncatedField {
    inner: TabulatedDustSystem,
    cell: usize,
}

impl DustSystem for TruncatedField {
    fn cell_assigner(&self) -> Arc<dyn ProcessAssigner> {
        self.inner.cell_assigner()
    }

    fn component_count(&self) -> usize {
        self.inner.component_count()
    }

    fn mix(&self, h: usize) -> &dyn DustMix {
        self.inner.mix(h)
    }

    fn mean_intensity(&self, m: usize) -> Array1<f64> {
        let field = self.inner.mean_intensity(m);
        if m == self.cell {
            field.slice(s![..1]).to_owned()
        } else {
            field
        }
    }

    fn density(&self, m: usize, h: usize) -> f64 {
        self.inner.density(m, h)
    }
}

/// Maps every cell to a single entry.
struct SingleEntry;

impl LibraryMapping for SingleEntry {
    fn entry_count(&self, _ctx: &EmissionContext<'_>) -> Result<usize, DustLibError> {
        Ok(1)
    }

    fn build_mapping(&self, ctx: &EmissionContext<'_>) -> Result<Mapping, DustLibError> {
        Ok(vec![Some(0); ctx.system.cell_assigner().count()])
    }
}

fn serial_cells(cells: usize) -> Arc<dyn ProcessAssigner> {
    let mut assigner = StaggeredAssigner::new(0, 1).unwrap();
    assigner.assign(cells, 1);
    Arc::new(assigner)
}

fn two_bin_grid() -> TabulatedWavelengthGrid {
    TabulatedWavelengthGrid::new(array![1e-6, 2e-6], array![1.0, 1.0], IdenticalAssigner::new(0, 1).unwrap())
        .unwrap()
}

fn two_cell_system(grid: &dyn WavelengthGrid) -> TabulatedDustSystem {
    let mix = PowerLawMix::new("grey", grid, 1.0, 1e-6, 0.0).unwrap();
    TabulatedDustSystem::new(
        grid,
        serial_cells(2),
        vec![Box::new(mix)],
        array![[1.0, 1.0], [3.0, 1.0]],
        array![[1.0], [2.0]],
    )
    .unwrap()
}

fn model_grid(comm: &dyn Communicator) -> TabulatedWavelengthGrid {
    TabulatedWavelengthGrid::logarithmic(1e-7, 1e-3, BINS, IdenticalAssigner::for_comm(comm).unwrap()).unwrap()
}

/// Diluted stellar field falling off with cell index; the last cell is dark.
fn model_system(grid: &dyn WavelengthGrid, cells: Arc<dyn ProcessAssigner>) -> TabulatedDustSystem {
    let lambdas = grid.wavelengths();
    let fields = Array2::from_shape_fn((CELLS, BINS), |(m, ell)| {
        if m == CELLS - 1 {
            0.0
        } else {
            1e-9 / ((m + 1) as f64).powi(2) * planck(lambdas[ell], 5800.0)
        }
    });
    let densities = Array2::from_shape_fn((CELLS, 2), |(m, h)| if h == 0 { 1.0 + m as f64 } else { 0.5 });
    let mixes: Vec<Box<dyn DustMix>> = vec![
        Box::new(PowerLawMix::new("silicate", grid, 1.0, 1e-6, 2.0).unwrap()),
        Box::new(PowerLawMix::new("graphite", grid, 2.0, 1e-6, 1.0).unwrap()),
    ];
    TabulatedDustSystem::new(grid, cells, mixes, fields, densities).unwrap()
}

/// Two cells sharing one entry, each holding only one of two components.
fn two_component_system(grid: &dyn WavelengthGrid) -> TabulatedDustSystem {
    let mixes: Vec<Box<dyn DustMix>> = vec![
        Box::new(PowerLawMix::new("silicate", grid, 1.0, 1e-6, 0.0).unwrap()),
        Box::new(PowerLawMix::new("graphite", grid, 1.0, 1e-6, 0.0).unwrap()),
    ];
    TabulatedDustSystem::new(
        grid,
        serial_cells(2),
        mixes,
        array![[1.0, 1.0], [3.0, 1.0]],
        array![[1.0, 0.0], [0.0, 1.0]],
    )
    .unwrap()
}

fn full_table(library: &DustLib) -> Array2<f64> {
    Array2::from_shape_fn((CELLS, BINS), |(m, ell)| library.luminosity(m, ell).unwrap())
}

fn serial_reference(make: impl Fn() -> DustLib) -> Array2<f64> {
    let comm = SerialCommunicator::new();
    let grid = model_grid(&comm);
    let system = model_system(&grid, serial_cells(CELLS));
    let emissivity = GreyBodyEmissivity::new(&grid);
    let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);
    let mut library = make();
    library.calculate(&ctx).unwrap();
    full_table(&library)
}

fn ensemble_tables(size: usize, data_parallel: bool, make: impl Fn() -> DustLib + Sync) -> Vec<Array2<f64>> {
    let comms = ThreadCommunicator::ensemble(size, data_parallel).unwrap();
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                let make = &make;
                scope.spawn(move || {
                    let grid = model_grid(comm);
                    let cells = Arc::from(assigned(data_parallel, comm, CELLS, 1).unwrap());
                    let system = model_system(&grid, cells);
                    let emissivity = GreyBodyEmissivity::new(&grid);
                    let ctx = EmissionContext::new(comm, &system, &emissivity, &grid);
                    let mut library = make();
                    library.calculate(&ctx).unwrap();
                    full_table(&library)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_shared_entry_uses_mean_field_and_normalizes_each_cell() {
    let comm = SerialCommunicator::new();
    let grid = two_bin_grid();
    let system = two_cell_system(&grid);
    let emissivity = RecordingEmissivity::new(array![1.0, 3.0]);
    let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);

    let mut library = DustLib::new(SingleEntry);
    library.calculate(&ctx).unwrap();

    assert_eq!(emissivity.fields(), vec![vec![2.0, 1.0]]);
    for m in 0..2 {
        let row = [library.luminosity(m, 0).unwrap(), library.luminosity(m, 1).unwrap()];
        assert_relative_eq!(row[0] + row[1], 1.0, epsilon = 1e-9);
        assert_relative_eq!(row[0], 0.25, epsilon = 1e-12);
        assert_relative_eq!(row[1], 0.75, epsilon = 1e-12);
    }
    assert_eq!(library.stats().entries_in_use, 1);
    assert_eq!(library.stats().mapped_cells, 2);
}

#[test]
fn test_zero_emission_is_left_unnormalized() {
    let comm = SerialCommunicator::new();
    let grid = two_bin_grid();
    let system = two_cell_system(&grid);
    let emissivity = RecordingEmissivity::new(array![0.0, 0.0]);
    let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);

    let mut library = DustLib::all_cells();
    library.calculate(&ctx).unwrap();
    for m in 0..2 {
        for ell in 0..2 {
            assert_eq!(library.luminosity(m, ell).unwrap(), 0.0);
        }
    }
}

#[test]
fn test_identity_mapping_covers_every_cell() {
    let comm = SerialCommunicator::new();
    let grid = model_grid(&comm);
    let system = model_system(&grid, serial_cells(CELLS));
    let emissivity = GreyBodyEmissivity::new(&grid);
    let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);

    let policy = AllCellsLibrary;
    assert_eq!(policy.entry_count(&ctx).unwrap(), CELLS);
    let mapping = policy.build_mapping(&ctx).unwrap();
    assert!(mapping.iter().enumerate().all(|(c, e)| *e == Some(c)));

    let inverse = invert_mapping(&mapping, CELLS, system.cell_assigner().as_ref()).unwrap();
    assert!(inverse.iter().enumerate().all(|(n, cells)| cells == &vec![n]));
}

#[test]
fn test_luminosity_before_calculate_fails() {
    let library = DustLib::all_cells();
    assert_eq!(library.state(), LibraryState::Uninitialized);
    assert!(matches!(library.luminosity(0, 0), Err(DustLibError::NotCalculated)));
}

#[test]
fn test_normalized_rows_sum_to_one() {
    let table = serial_reference(DustLib::all_cells);
    for m in 0..CELLS - 1 {
        assert_relative_eq!(table.row(m).sum(), 1.0, epsilon = 1e-9);
    }
    assert!(table.row(CELLS - 1).iter().all(|&v| v == 0.0));
}

#[test]
fn test_repeated_calculation_is_idempotent() {
    let comm = SerialCommunicator::new();
    let grid = model_grid(&comm);
    let system = model_system(&grid, serial_cells(CELLS));
    let emissivity = GreyBodyEmissivity::new(&grid);
    let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);

    let mut library = DustLib::all_cells();
    library.calculate(&ctx).unwrap();
    let first = full_table(&library);
    library.calculate(&ctx).unwrap();
    assert_eq!(library.state(), LibraryState::Synced);
    assert_eq!(full_table(&library), first);
}

#[test]
fn test_data_parallel_ensemble_matches_serial() {
    let reference = serial_reference(DustLib::all_cells);
    for table in ensemble_tables(3, true, DustLib::all_cells) {
        for (a, b) in table.iter().zip(reference.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12, max_relative = 1e-12);
        }
    }
}

#[test]
fn test_task_parallel_ensemble_matches_serial() {
    let reference = serial_reference(DustLib::all_cells);
    for table in ensemble_tables(4, false, DustLib::all_cells) {
        for (a, b) in table.iter().zip(reference.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12, max_relative = 1e-12);
        }
    }
}

#[test]
fn test_mismatched_parallel_mode_is_rejected() {
    let comms = ThreadCommunicator::ensemble(2, true).unwrap();
    let errors: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                scope.spawn(move || {
                    let grid = model_grid(comm);
                    // replicated cells on a data parallel ensemble
                    let cells = Arc::from(assigned(false, comm, CELLS, 1).unwrap());
                    let system = model_system(&grid, cells);
                    let emissivity = GreyBodyEmissivity::new(&grid);
                    let ctx = EmissionContext::new(comm, &system, &emissivity, &grid);
                    DustLib::all_cells().calculate(&ctx).unwrap_err()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(errors.iter().all(|e| matches!(e, DustLibError::Configuration(_))));
}

#[test]
fn test_strength_binned_library_skips_dark_cells() {
    let comm = SerialCommunicator::new();
    let grid = model_grid(&comm);
    let system = model_system(&grid, serial_cells(CELLS));
    let emissivity = GreyBodyEmissivity::new(&grid);
    let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);

    let policy = StrengthBinnedLibrary::new(3).unwrap();
    let mapping = policy.build_mapping(&ctx).unwrap();
    assert_eq!(mapping.len(), CELLS);
    assert_eq!(mapping[0], Some(2));
    assert_eq!(mapping[CELLS - 2], Some(0));
    assert_eq!(mapping[CELLS - 1], None);

    let mut library = DustLib::new(policy);
    library.calculate(&ctx).unwrap();
    let stats = library.stats();
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.mapped_cells, CELLS - 1);
    assert!(stats.entries_in_use <= 3);
    assert!((0..BINS).all(|ell| library.luminosity(CELLS - 1, ell).unwrap() == 0.0));
}

#[test]
fn test_task_parallel_binned_library_matches_serial() {
    let make = || DustLib::new(StrengthBinnedLibrary::new(4).unwrap());
    let reference = serial_reference(make);
    for table in ensemble_tables(3, false, make) {
        for (a, b) in table.iter().zip(reference.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12, max_relative = 1e-12);
        }
    }
}

#[test]
fn test_shared_entry_weights_each_component_by_cell_density() {
    let comm = SerialCommunicator::new();
    let grid = two_bin_grid();
    let system = two_component_system(&grid);
    let emissivity = RecordingEmissivity::new(array![1.0, 1.0])
        .with_mix("silicate", array![1.0, 3.0])
        .with_mix("graphite", array![3.0, 1.0]);
    let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);

    let mut library = DustLib::new(SingleEntry);
    library.calculate(&ctx).unwrap();

    assert_eq!(emissivity.fields(), vec![vec![2.0, 1.0], vec![2.0, 1.0]]);
    assert_eq!(emissivity.mixes(), vec!["silicate", "graphite"]);

    let rows: Vec<[f64; 2]> = (0..2)
        .map(|m| [library.luminosity(m, 0).unwrap(), library.luminosity(m, 1).unwrap()])
        .collect();
    for row in &rows {
        assert_relative_eq!(row[0] + row[1], 1.0, epsilon = 1e-12);
    }
    assert_relative_eq!(rows[0][0], 0.25, epsilon = 1e-12);
    assert_relative_eq!(rows[0][1], 0.75, epsilon = 1e-12);
    assert_relative_eq!(rows[1][0], 0.75, epsilon = 1e-12);
    assert_relative_eq!(rows[1][1], 0.25, epsilon = 1e-12);
    assert_ne!(rows[0], rows[1]);
}

#[test]
fn test_progress_logging_leaves_results_unchanged() {
    let reference = serial_reference(DustLib::all_cells);

    let comm = SerialCommunicator::new();
    let grid = model_grid(&comm);
    let system = model_system(&grid, serial_cells(CELLS));
    let emissivity = GreyBodyEmissivity::new(&grid);
    let logging = LoggingEmissivity(emissivity);
    let ctx = EmissionContext::new(&comm, &system, &logging, &grid);

    let mut library = DustLib::all_cells();
    library.calculate(&ctx).unwrap();
    assert_eq!(full_table(&library), reference);

    let recording = RecordingEmissivity::new(array![1.0, 3.0]).with_log_frequency(true);
    let grid = two_bin_grid();
    let system = two_cell_system(&grid);
    let ctx = EmissionContext::new(&comm, &system, &recording, &grid);
    let mut library = DustLib::all_cells();
    library.calculate(&ctx).unwrap();
    assert_eq!(recording.fields().len(), 2);
    assert_relative_eq!(library.luminosity(1, 1).unwrap(), 0.75, epsilon = 1e-12);
}

/// Grey-body emissivity that asks the engine for progress lines.
struct LoggingEmissivity(GreyBodyEmissivity);

impl DustEmissivity for LoggingEmissivity {
    fn emissivity(&self, mix: &dyn DustMix, field: ArrayView1<'_, f64>) -> Result<Array1<f64>, PhysicsError> {
        self.0.emissivity(mix, field)
    }

    fn log_frequency(&self) -> bool {
        true
    }
}

#[test]
fn test_truncated_field_is_a_length_mismatch_when_binning() {
    let comm = SerialCommunicator::new();
    let grid = model_grid(&comm);
    let system = TruncatedField {
        inner: model_system(&grid, serial_cells(CELLS)),
        cell: 1,
    };
    let emissivity = GreyBodyEmissivity::new(&grid);
    let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);

    let policy = StrengthBinnedLibrary::new(3).unwrap();
    assert!(matches!(
        policy.build_mapping(&ctx),
        Err(DustLibError::Physics(PhysicsError::LengthMismatch { expected: BINS, actual: 1, .. }))
    ));
}

/// Runs `calculate` on a thread ensemble whose cell 1 reports a truncated
/// field, returning each rank's error in rank order. Fails the test if any
/// rank does not return.
fn failing_ensemble(size: usize, data_parallel: bool, make: fn() -> DustLib) -> Vec<Option<DustLibError>> {
    let comms = ThreadCommunicator::ensemble(size, data_parallel).unwrap();
    let (tx, rx) = mpsc::channel();
    for comm in comms {
        let tx = tx.clone();
        std::thread::spawn(move || {
            let grid = model_grid(&comm);
            let cells = Arc::from(assigned(data_parallel, &comm, CELLS, 1).unwrap());
            let system = TruncatedField {
                inner: model_system(&grid, cells),
                cell: 1,
            };
            let emissivity = GreyBodyEmissivity::new(&grid);
            let ctx = EmissionContext::new(&comm, &system, &emissivity, &grid);
            let outcome = make().calculate(&ctx).err();
            let _ = tx.send((comm.rank(), outcome));
        });
    }
    drop(tx);

    let mut outcomes: Vec<_> = (0..size)
        .map(|_| rx.recv_timeout(Duration::from_secs(30)).expect("a rank never returned from calculate"))
        .collect();
    outcomes.sort_by_key(|(rank, _)| *rank);
    outcomes.into_iter().map(|(_, outcome)| outcome).collect()
}

#[test]
fn test_kernel_failure_on_one_rank_fails_every_rank() {
    // entries are staggered, so cell 1 is evaluated on rank 1 only
    let outcomes = failing_ensemble(2, false, DustLib::all_cells);
    assert!(matches!(outcomes[0], Some(DustLibError::EnsembleAborted)));
    assert!(matches!(
        outcomes[1],
        Some(DustLibError::Physics(PhysicsError::LengthMismatch { .. }))
    ));
}

#[test]
fn test_binning_failure_on_one_rank_fails_every_rank() {
    // cells are staggered, so cell 1 is binned on rank 1 only
    let outcomes = failing_ensemble(2, true, || DustLib::new(StrengthBinnedLibrary::new(4).unwrap()));
    assert!(matches!(outcomes[0], Some(DustLibError::EnsembleAborted)));
    assert!(matches!(
        outcomes[1],
        Some(DustLibError::Physics(PhysicsError::LengthMismatch { .. }))
    ));
}
