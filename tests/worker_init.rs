//! Worker initialization tests.
//!
//! Tests cover:
//! - Whole-graph sharding across workers (disjoint, exhaustive splits)
//! - Sharding composition across distributed ranks and local workers
//! - Dispatch wiring: stub extraction, queue consumer substitution
//! - Custom initialization hooks and their validation

use data_pipeline::dispatch::{extract_non_replicable, Dispatcher};
use data_pipeline::graph::{
    apply_sharding, contains_pipe, Concat, NonReplicable, ShardingFilter, Shuffler, VecSource,
};
use data_pipeline::worker::{initialize_worker, reset_worker, CustomWorkerFn};
use data_pipeline::{DataPipe, DistInfo, ShardingPriority, WorkerInfo, WorkerPool};

// ============================================================================
// Common Helper Functions
// ============================================================================

fn sharded_source(items: std::ops::Range<i64>) -> Box<dyn DataPipe<i64>> {
    Box::new(ShardingFilter::new(Box::new(VecSource::new(
        items.collect(),
    ))))
}

fn drain(pipe: &mut dyn DataPipe<i64>) -> Vec<i64> {
    let mut items = Vec::new();
    while let Some(item) = pipe.next().unwrap() {
        items.push(item);
    }
    items
}

// ============================================================================
// Whole-graph sharding
// ============================================================================

#[test]
fn workers_receive_disjoint_exhaustive_shards() {
    let num_workers = 4;
    let mut all = Vec::new();
    for worker_id in 0..num_workers {
        let info = WorkerInfo::new(num_workers, worker_id).unwrap();
        let mut pipe = initialize_worker(sharded_source(0..22), &info, None, None).unwrap();
        let shard = drain(pipe.as_mut());

        // Round-robin: worker w sees positions w, w+n, w+2n, ...
        let expected: Vec<i64> = (0..22)
            .filter(|i| (*i as usize) % num_workers == worker_id)
            .collect();
        assert_eq!(shard, expected);
        all.extend(shard);
    }
    all.sort_unstable();
    assert_eq!(all, (0..22).collect::<Vec<_>>());
}

#[test]
fn rank_and_worker_sharding_compose() {
    // 2 ranks x 2 workers: rank-level sharding is installed by the factory
    // at a coarser priority, worker-level sharding by the pool on top.
    // Every item lands in exactly one (rank, worker) cell.
    let mut all = Vec::new();
    for rank in 0..2 {
        let factory = move || -> Box<dyn DataPipe<i64>> {
            let mut pipe = sharded_source(0..16);
            apply_sharding(pipe.as_mut(), 2, rank, ShardingPriority::DistributedSampling)
                .unwrap();
            pipe
        };
        let pool = WorkerPool::spawn(2, 4, 2, rank, factory).unwrap();
        all.extend(pool.run_epoch(42).unwrap());
    }
    all.sort_unstable();
    assert_eq!(all, (0..16).collect::<Vec<_>>());
}

// ============================================================================
// Dispatch wiring
// ============================================================================

fn mixed_graph() -> Box<dyn DataPipe<i64>> {
    Box::new(Concat::new(vec![
        Box::new(NonReplicable::new(Box::new(Shuffler::new(Box::new(
            VecSource::new((0i64..8).collect()),
        ))))) as Box<dyn DataPipe<i64>>,
        sharded_source(100..108),
    ]))
}

#[test]
fn dispatch_branch_items_are_shared_not_replicated() {
    let mut probe = mixed_graph();
    let branch = extract_non_replicable(&mut probe).unwrap().unwrap();
    let mut dispatcher = Dispatcher::spawn(branch, 2, 4).unwrap();
    let dist = DistInfo::new(42);

    // Drive both workers from one thread: initialize, reset, then drain.
    let mut all = Vec::new();
    let mut graphs = Vec::new();
    for worker_id in 0..2 {
        let info = WorkerInfo::new(2, worker_id).unwrap();
        let mut pipe = mixed_graph();
        extract_non_replicable(&mut pipe).unwrap();
        let pipe = initialize_worker(
            pipe,
            &info,
            Some(dispatcher.take_client(worker_id).unwrap()),
            None,
        )
        .unwrap();
        graphs.push(reset_worker(pipe, &info, &dist, None).unwrap());
    }
    for graph in &mut graphs {
        all.extend(drain(graph.as_mut()));
    }

    // Dispatch items 0..8 appear once across workers; the replicable branch
    // 100..108 is sharded, so it also appears once.
    all.sort_unstable();
    let expected: Vec<i64> = (0..8).chain(100..108).collect();
    assert_eq!(all, expected);
    assert_eq!(dispatcher.resets_served(), 1);
}

#[test]
fn initialized_graph_has_no_stub_left() {
    let mut probe = mixed_graph();
    let branch = extract_non_replicable(&mut probe).unwrap().unwrap();
    let mut dispatcher = Dispatcher::spawn(branch, 1, 4).unwrap();

    let info = WorkerInfo::new(1, 0).unwrap();
    let mut pipe = mixed_graph();
    extract_non_replicable(&mut pipe).unwrap();
    let pipe = initialize_worker(pipe, &info, Some(dispatcher.take_client(0).unwrap()), None)
        .unwrap();
    assert!(!contains_pipe(pipe.as_ref(), &|stage| stage.is_dispatch_stub()));
    assert!(contains_pipe(pipe.as_ref(), &|stage| {
        stage.name() == "queue_consumer"
    }));
}

// ============================================================================
// Custom hooks
// ============================================================================

#[test]
fn custom_hook_can_rewrap_the_graph() {
    let info = WorkerInfo::new(2, 1).unwrap();
    let hook: Box<CustomWorkerFn<i64>> = Box::new(|pipe, info| {
        assert_eq!(info.worker_id, 1);
        Ok(Box::new(Shuffler::new(pipe)) as Box<dyn DataPipe<i64>>)
    });
    let pipe = initialize_worker(sharded_source(0..8), &info, None, Some(hook.as_ref()))
        .unwrap();
    assert_eq!(pipe.name(), "shuffler");
}

#[test]
fn custom_hook_may_not_introduce_a_non_replicable_branch() {
    let info = WorkerInfo::new(1, 0).unwrap();
    let hook: Box<CustomWorkerFn<i64>> = Box::new(|pipe, _info| {
        Ok(Box::new(NonReplicable::new(pipe)) as Box<dyn DataPipe<i64>>)
    });
    assert!(initialize_worker(sharded_source(0..8), &info, None, Some(hook.as_ref())).is_err());
}
