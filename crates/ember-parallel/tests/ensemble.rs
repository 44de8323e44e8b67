//! Multi-rank behaviour of the collectives and the distributed table, run on
//! an in-process thread ensemble.

use std::sync::Arc;

use ember_parallel::{
    Axis, Communicator, IdenticalAssigner, ParallelTable, ProcessAssigner, StaggeredAssigner,
    ThreadCommunicator,
};

fn run_ensemble<T: Send>(
    size: usize,
    data_parallel: bool,
    body: impl Fn(&ThreadCommunicator) -> T + Sync,
) -> Vec<T> {
    let comms = ThreadCommunicator::ensemble(size, data_parallel).unwrap();
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| scope.spawn(|| body(comm)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn assigned(distributing: bool, comm: &dyn Communicator, size: usize) -> Arc<dyn ProcessAssigner> {
    let mut assigner: Box<dyn ProcessAssigner> = if distributing {
        Box::new(StaggeredAssigner::for_comm(comm).unwrap())
    } else {
        Box::new(IdenticalAssigner::for_comm(comm).unwrap())
    };
    assigner.assign(size, 1);
    Arc::from(assigner)
}

#[test]
fn test_staggered_ensemble_covers_range_once() {
    let owned = run_ensemble(3, true, |comm| {
        let assigner = assigned(true, comm, 10);
        (0..assigner.count())
            .map(|r| assigner.absolute_index(r))
            .collect::<Vec<_>>()
    });
    assert_eq!(owned[0], vec![0, 3, 6, 9]);
    assert_eq!(owned[1], vec![1, 4, 7]);
    assert_eq!(owned[2], vec![2, 5, 8]);
    assert_eq!(owned.iter().map(Vec::len).sum::<usize>(), 10);
}

#[test]
fn test_gather_irregular_assembles_on_root() {
    let gathered = run_ensemble(3, true, |comm| {
        // rank r contributes one block of two values per owned index
        let assigner = assigned(true, comm, 5);
        let send: Vec<f64> = (0..assigner.count())
            .flat_map(|r| {
                let t = assigner.absolute_index(r) as f64;
                [t, -t]
            })
            .collect();
        let mut displacements = vec![Vec::new(); comm.size()];
        for t in 0..5 {
            displacements[assigner.rank_for_index(t)].push(t * 2);
        }
        let mut recv = vec![f64::NAN; 10];
        comm.gather_irregular(&send, 2, &mut recv, 1, &displacements)
            .unwrap();
        recv
    });

    assert_eq!(
        gathered[1],
        vec![0.0, -0.0, 1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0]
    );
    assert!(gathered[0].iter().all(|v| v.is_nan()));
    assert!(gathered[2].iter().all(|v| v.is_nan()));
}

#[test]
fn test_all_to_all_irregular_routes_blocks() {
    let received = run_ensemble(3, true, |comm| {
        let rank = comm.rank();
        let size = comm.size();
        // one value addressed to every destination, encoding (source, destination)
        let send: Vec<f64> = (0..size).map(|dest| (10 * rank + dest) as f64).collect();
        let send_displacements: Vec<Vec<usize>> = (0..size).map(|dest| vec![dest]).collect();
        let recv_displacements: Vec<Vec<usize>> = (0..size).map(|source| vec![source]).collect();
        let mut recv = vec![0.0; size];
        comm.all_to_all_irregular(&send, &send_displacements, &mut recv, &recv_displacements, 1)
            .unwrap();
        recv
    });

    for (rank, recv) in received.iter().enumerate() {
        let expected: Vec<f64> = (0..3).map(|source| (10 * source + rank) as f64).collect();
        assert_eq!(recv, &expected);
    }
}

#[test]
fn test_distributed_rows_are_resident_everywhere_after_sync() {
    let rows = 7;
    let cols = 3;
    let tables = run_ensemble(3, true, |comm| {
        let row_assigner = assigned(true, comm, rows);
        let col_assigner = assigned(false, comm, cols);
        let mut table = ParallelTable::new();
        table.initialize("test", Arc::clone(&row_assigner), col_assigner, Axis::Row);

        for r in 0..row_assigner.count() {
            let m = row_assigner.absolute_index(r);
            let mut row = table.row_mut(m).unwrap();
            for ell in 0..cols {
                row[ell] = (m * 100 + ell) as f64;
            }
        }
        // foreign rows are not writable
        let foreign = (comm.rank() + 1) % comm.size();
        assert!(table.row_mut(foreign).is_err());

        table.sync(comm).unwrap();
        let mut values = Vec::new();
        for m in 0..rows {
            for ell in 0..cols {
                values.push(table.value(m, ell).unwrap());
            }
        }
        values
    });

    let expected: Vec<f64> = (0..rows)
        .flat_map(|m| (0..cols).map(move |ell| (m * 100 + ell) as f64))
        .collect();
    for values in tables {
        assert_eq!(values, expected);
    }
}

#[test]
fn test_replicated_rows_are_summed_by_sync() {
    let rows = 5;
    let tables = run_ensemble(2, false, |comm| {
        let row_assigner = assigned(false, comm, rows);
        let col_assigner = assigned(false, comm, 1);
        let mut table = ParallelTable::new();
        table.initialize("replicated", row_assigner, col_assigner, Axis::Row);

        // each row written by exactly one rank
        for m in (comm.rank()..rows).step_by(comm.size()) {
            table.row_mut(m).unwrap()[0] = m as f64 + 0.5;
        }
        table.sync(comm).unwrap();
        (0..rows).map(|m| table.value(m, 0).unwrap()).collect::<Vec<_>>()
    });

    for values in tables {
        assert_eq!(values, vec![0.5, 1.5, 2.5, 3.5, 4.5]);
    }
}

#[test]
fn test_barrier_releases_all_ranks() {
    let done = run_ensemble(4, true, |comm| {
        comm.barrier("the test scope").unwrap();
        let mut total = 1.0;
        comm.all_reduce_sum_scalar(&mut total).unwrap();
        total
    });
    assert_eq!(done, vec![4.0; 4]);
}
