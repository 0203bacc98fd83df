//! src/worker/init.rs
//!
//! The two entry points a worker runs on its own copy of the pipe graph:
//! [`initialize_worker`] once after the graph is handed over, and
//! [`reset_worker`] at the start of every epoch.

use anyhow::{anyhow, bail, ensure, Result};

use super::{DistInfo, WorkerInfo};
use crate::dispatch::{QueueClient, QueueConsumer};
use crate::graph::{
    apply_random_seed, apply_sharding, apply_sharding_to_replicable_branches, contains_pipe,
    count_pipes, for_each_pipe, replace_pipe, reset_graph, DataPipe, ShardingPriority,
};
use crate::seed::SeedGenerator;
use crate::worker::rng::set_global_random_state;

/// User hook rewriting a worker's graph during initialization or reset.
/// Receives the graph after the built-in steps and must hand back a fully
/// replicable graph with no dispatch stubs left in it.
pub type CustomWorkerFn<T> =
    dyn Fn(Box<dyn DataPipe<T>>, &WorkerInfo) -> Result<Box<dyn DataPipe<T>>> + Send + Sync;

fn validate_custom_graph<T: Send>(pipe: &dyn DataPipe<T>, hook: &str) -> Result<()> {
    ensure!(
        !contains_pipe(pipe, &|stage| stage.is_dispatch_stub()),
        "graph returned by the custom {} hook still contains a dispatch stub",
        hook
    );
    ensure!(
        !contains_pipe(pipe, &|stage| !stage.is_replicable()),
        "graph returned by the custom {} hook contains a non-replicable branch",
        hook
    );
    Ok(())
}

/// One-time setup of a worker's graph copy: sharding plus dispatch wiring.
///
/// For a fully replicable graph the whole tree is sharded across the local
/// workers and no queue client may be passed. For a graph holding a dispatch
/// stub, only the replicable branches are sharded (the dispatcher's output is
/// already shared) and the stub is swapped for a [`QueueConsumer`] over the
/// worker's queue pair, which must be passed. Any custom hook runs last and
/// its result is validated.
pub fn initialize_worker<T: Send + 'static>(
    mut pipe: Box<dyn DataPipe<T>>,
    worker_info: &WorkerInfo,
    queue_client: Option<QueueClient<T>>,
    custom_init: Option<&CustomWorkerFn<T>>,
) -> Result<Box<dyn DataPipe<T>>> {
    let stubs = count_pipes(pipe.as_ref(), &|stage| stage.is_dispatch_stub());
    match stubs {
        0 => {
            ensure!(
                queue_client.is_none(),
                "queue client provided but the graph has no dispatch stub"
            );
            apply_sharding(
                pipe.as_mut(),
                worker_info.num_workers,
                worker_info.worker_id,
                ShardingPriority::Multiprocessing,
            )?;
        }
        1 => {
            let client = queue_client.ok_or_else(|| {
                anyhow!("graph has a dispatch stub but no queue client was provided")
            })?;
            apply_sharding_to_replicable_branches(
                pipe.as_mut(),
                worker_info.num_workers,
                worker_info.worker_id,
                ShardingPriority::Multiprocessing,
            )?;
            let consumer: Box<dyn DataPipe<T>> = Box::new(QueueConsumer::new(client));
            replace_pipe(&mut pipe, &|stage| stage.is_dispatch_stub(), consumer);
        }
        n => bail!("found {} dispatch stubs, at most one is supported", n),
    }

    if let Some(custom) = custom_init {
        pipe = custom(pipe, worker_info)?;
        validate_custom_graph(pipe.as_ref(), "initialization")?;
    }
    Ok(pipe)
}

/// Per-epoch reset of a worker's graph and global random state.
///
/// Worker 0 first forwards the epoch's shared seed to the dispatch process
/// (exactly once per epoch across all workers). Then every worker seeds its
/// graph copy from the shared seed, so all copies agree on per-stage seeds,
/// and seeds its own global random state from the worker seed, so draws
/// outside the graph stay distinct per worker. Iteration state is restarted
/// last, before any custom hook.
pub fn reset_worker<T: Send + 'static>(
    mut pipe: Box<dyn DataPipe<T>>,
    worker_info: &WorkerInfo,
    dist_info: &DistInfo,
    custom_reset: Option<&CustomWorkerFn<T>>,
) -> Result<Box<dyn DataPipe<T>>> {
    let mut consumers = 0;
    let mut outcome = Ok(());
    for_each_pipe(pipe.as_mut(), &mut |stage| {
        if let Some(consumer) = stage.as_dispatch_consumer() {
            consumers += 1;
            if worker_info.worker_id == 0 && consumers == 1 && outcome.is_ok() {
                outcome = consumer.reset_epoch(dist_info.shared_seed);
            }
        }
    });
    outcome?;
    ensure!(
        consumers <= 1,
        "found {} queue consumers, at most one is supported",
        consumers
    );

    let mut seeds = SeedGenerator::new(dist_info.shared_seed);
    apply_random_seed(pipe.as_mut(), &mut seeds);

    seeds.reseed(dist_info.worker_seed(worker_info.worker_id));
    set_global_random_state(&mut seeds);

    reset_graph(pipe.as_mut());

    if let Some(custom) = custom_reset {
        pipe = custom(pipe, worker_info)?;
        validate_custom_graph(pipe.as_ref(), "reset")?;
    }
    Ok(pipe)
}

/// Epoch reseed of the dispatch process: its branch and its own thread RNG,
/// both driven by the shared seed so the branch's shuffle order agrees
/// across every rank of the job.
pub fn dispatch_reset<T: Send>(pipe: &mut dyn DataPipe<T>, shared_seed: u64) {
    let mut seeds = SeedGenerator::new(shared_seed);
    apply_random_seed(pipe, &mut seeds);
    crate::worker::rng::set_thread_rng(seeds.next_seed());
}
