//! src/worker/pool.rs
//!
//! Thread pool driving one pipe graph copy per worker.
//!
//! Each worker thread builds its own graph from a shared factory, runs
//! [`initialize_worker`] once, then waits on a dedicated control channel for
//! epoch starts. When the factory's graph contains a non-replicable branch,
//! the pool extracts that branch from a probe copy and runs it in a single
//! [`Dispatcher`] thread that every worker consumes from.
//!
//! # Key properties
//! - Bounded channels prevent memory bloat
//! - Graceful shutdown on drop
//! - Thread-local worker IDs for error messages and sharding
//! - Per-worker control channels for deterministic epoch starts

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::init::{initialize_worker, reset_worker};
use super::rng::set_worker_id;
use super::{DistInfo, WorkerInfo};
use crate::dispatch::{extract_non_replicable, Dispatcher, QueueClient};
use crate::graph::DataPipe;

/// How long workers wait on a channel before rechecking the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct EpochStart {
    shared_seed: u64,
}

enum WorkerEvent<T> {
    Item(Result<T>),
    EpochDone,
}

/// Thread pool running one worker per graph copy.
///
/// Communication:
/// - Control channels: main thread -> workers (epoch starts)
/// - Output channel: workers -> main thread (items and epoch completions)
/// - Shutdown flag: enables graceful termination
pub struct WorkerPool<T: Send + 'static> {
    workers: Vec<thread::JoinHandle<()>>,
    control_txs: Vec<Sender<EpochStart>>,
    output_rx: Receiver<WorkerEvent<T>>,
    shutdown: Arc<AtomicBool>,
    // Dropped after the workers so in-flight queue requests still get served.
    dispatcher: Option<Dispatcher<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `num_workers` workers for one member of a `world_size`-rank
    /// job. `factory` must build structurally identical graphs on every call
    /// and every rank.
    pub fn spawn<F>(
        num_workers: usize,
        buffer_size: usize,
        world_size: usize,
        rank: usize,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn() -> Box<dyn DataPipe<T>> + Send + Sync + 'static,
    {
        if num_workers == 0 {
            return Err(anyhow!(
                "Cannot create WorkerPool with 0 workers. \
                Either set num_workers > 0 or use single-threaded mode."
            ));
        }
        if buffer_size == 0 {
            return Err(anyhow!(
                "Cannot create WorkerPool with buffer_size 0. \
                Buffer size must be > 0 to prevent deadlocks."
            ));
        }
        // Validates world_size/rank; the per-epoch seed comes later.
        DistInfo::with_rank(0, world_size, rank)?;

        // Probe one graph copy for a non-replicable branch. The branch moves
        // into the dispatcher; the rest of the probe copy is discarded and
        // each worker rebuilds its own copy from the factory.
        let mut probe = factory();
        let mut dispatcher = match extract_non_replicable(&mut probe)? {
            Some(branch) => Some(Dispatcher::spawn(branch, num_workers, buffer_size)?),
            None => None,
        };
        drop(probe);

        let (output_tx, output_rx) = bounded(buffer_size * num_workers);
        let shutdown = Arc::new(AtomicBool::new(false));
        let factory = Arc::new(factory);

        let mut control_txs = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (control_tx, control_rx) = bounded::<EpochStart>(1);
            control_txs.push(control_tx);

            let client = match dispatcher.as_mut() {
                Some(dispatcher) => Some(dispatcher.take_client(worker_id)?),
                None => None,
            };
            let factory = factory.clone();
            let output_tx = output_tx.clone();
            let shutdown_flag = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("datapipe-worker-{}", worker_id))
                .spawn(move || {
                    set_worker_id(worker_id);
                    run_worker(
                        worker_id,
                        num_workers,
                        world_size,
                        rank,
                        factory,
                        client,
                        control_rx,
                        output_tx,
                        shutdown_flag,
                    );
                })
                .with_context(|| format!("Failed to spawn worker thread {}", worker_id))?;
            workers.push(handle);
        }

        Ok(Self {
            workers,
            control_txs,
            output_rx,
            shutdown,
            dispatcher,
        })
    }

    /// Runs one epoch under `shared_seed` and collects every item produced
    /// by the workers. Item order interleaves across workers; with one
    /// worker it is the graph's own order. The first worker error is
    /// returned after the epoch has fully drained.
    pub fn run_epoch(&self, shared_seed: u64) -> Result<Vec<T>> {
        for control_tx in &self.control_txs {
            control_tx
                .send(EpochStart { shared_seed })
                .map_err(|_| anyhow!("worker thread terminated before the epoch started"))?;
        }

        let mut items = Vec::new();
        let mut first_error: Option<anyhow::Error> = None;
        let mut remaining = self.workers.len();
        while remaining > 0 {
            match self.output_rx.recv() {
                Ok(WorkerEvent::Item(Ok(item))) => items.push(item),
                Ok(WorkerEvent::Item(Err(error))) => {
                    first_error.get_or_insert(error);
                }
                Ok(WorkerEvent::EpochDone) => remaining -= 1,
                Err(_) => bail!("worker threads terminated mid-epoch"),
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(items),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Epoch reseeds handled by the dispatch process; 0 for a fully
    /// replicable graph.
    pub fn dispatch_resets_served(&self) -> usize {
        self.dispatcher
            .as_ref()
            .map_or(0, Dispatcher::resets_served)
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Wake workers parked on the dispatcher before joining them.
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.begin_shutdown();
        }
        self.control_txs.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // `dispatcher` drops after the workers, closing its queues last.
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker<T, F>(
    worker_id: usize,
    num_workers: usize,
    world_size: usize,
    rank: usize,
    factory: Arc<F>,
    client: Option<QueueClient<T>>,
    control_rx: Receiver<EpochStart>,
    output_tx: Sender<WorkerEvent<T>>,
    shutdown: Arc<AtomicBool>,
) where
    T: Send + 'static,
    F: Fn() -> Box<dyn DataPipe<T>> + Send + Sync + 'static,
{
    let info = WorkerInfo {
        num_workers,
        worker_id,
    };

    let mut graph: Option<Box<dyn DataPipe<T>>> = None;
    let mut failure: Option<String> = None;
    match setup_graph(factory.as_ref(), &info, client) {
        Ok(pipe) => graph = Some(pipe),
        Err(error) => failure = Some(format!("{error:#}")),
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let epoch = match control_rx.recv_timeout(POLL_INTERVAL) {
            Ok(epoch) => epoch,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if let Some(message) = &failure {
            let error = anyhow!("Worker {} failed to initialize: {}", worker_id, message);
            send_event(&output_tx, &shutdown, WorkerEvent::Item(Err(error)));
            send_event(&output_tx, &shutdown, WorkerEvent::EpochDone);
            continue;
        }

        let Some(pipe) = graph.take() else {
            send_event(&output_tx, &shutdown, WorkerEvent::EpochDone);
            continue;
        };
        let dist = DistInfo {
            shared_seed: epoch.shared_seed,
            world_size,
            rank,
        };
        match reset_worker(pipe, &info, &dist, None) {
            Ok(mut pipe) => {
                run_epoch_loop(worker_id, pipe.as_mut(), &output_tx, &shutdown);
                graph = Some(pipe);
            }
            Err(error) => {
                failure = Some(format!("{error:#}"));
                let error =
                    anyhow!("Worker {} failed to reset for the epoch: {}", worker_id, error);
                send_event(&output_tx, &shutdown, WorkerEvent::Item(Err(error)));
            }
        }
        send_event(&output_tx, &shutdown, WorkerEvent::EpochDone);
    }
}

fn setup_graph<T, F>(
    factory: &F,
    info: &WorkerInfo,
    client: Option<QueueClient<T>>,
) -> Result<Box<dyn DataPipe<T>>>
where
    T: Send + 'static,
    F: Fn() -> Box<dyn DataPipe<T>>,
{
    let mut pipe = factory();
    // The probe copy already owns the real branch; this worker's copy of it
    // is replaced by a stub and discarded.
    extract_non_replicable(&mut pipe)?;
    initialize_worker(pipe, info, client, None)
}

fn run_epoch_loop<T: Send>(
    worker_id: usize,
    pipe: &mut dyn DataPipe<T>,
    output_tx: &Sender<WorkerEvent<T>>,
    shutdown: &AtomicBool,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match pipe.next() {
            Ok(Some(item)) => {
                if !send_event(output_tx, shutdown, WorkerEvent::Item(Ok(item))) {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                let error = error
                    .context(format!("Worker {} failed to pull the next item", worker_id));
                send_event(output_tx, shutdown, WorkerEvent::Item(Err(error)));
                break;
            }
        }
    }
}

/// Sends with a bounded wait so a blocked worker still notices shutdown.
/// Returns false when the pool is shutting down or the receiver is gone.
fn send_event<T: Send>(
    output_tx: &Sender<WorkerEvent<T>>,
    shutdown: &AtomicBool,
    event: WorkerEvent<T>,
) -> bool {
    let mut event = event;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        match output_tx.send_timeout(event, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => event = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Concat, NonReplicable, ShardingFilter, Shuffler, VecSource};

    fn sharded_shuffled(n: i64) -> Box<dyn DataPipe<i64>> {
        Box::new(ShardingFilter::new(Box::new(Shuffler::new(Box::new(
            VecSource::new((0..n).collect()),
        )))))
    }

    #[test]
    fn rejects_empty_configurations() {
        assert!(WorkerPool::spawn(0, 4, 1, 0, || sharded_shuffled(4)).is_err());
        assert!(WorkerPool::spawn(2, 0, 1, 0, || sharded_shuffled(4)).is_err());
        assert!(WorkerPool::spawn(2, 4, 2, 2, || sharded_shuffled(4)).is_err());
    }

    #[test]
    fn epoch_covers_every_item_exactly_once() {
        let pool = WorkerPool::spawn(3, 4, 1, 0, || sharded_shuffled(20)).unwrap();
        let mut items = pool.run_epoch(42).unwrap();
        items.sort_unstable();
        assert_eq!(items, (0..20).collect::<Vec<_>>());
        assert_eq!(pool.dispatch_resets_served(), 0);
    }

    #[test]
    fn single_worker_epochs_replay_under_the_same_seed() {
        let pool = WorkerPool::spawn(1, 4, 1, 0, || sharded_shuffled(16)).unwrap();
        let first = pool.run_epoch(42).unwrap();
        assert_eq!(pool.run_epoch(42).unwrap(), first);
        assert_ne!(pool.run_epoch(1337).unwrap(), first);
    }

    #[test]
    fn dispatch_branch_is_served_once_per_epoch() {
        // concat(non-replicable shuffled half, sharded half): the first
        // branch flows through the dispatcher, the second is sharded
        // per-worker. Together they must cover 0..20 exactly once.
        let factory = || -> Box<dyn DataPipe<i64>> {
            Box::new(Concat::new(vec![
                Box::new(NonReplicable::new(Box::new(Shuffler::new(Box::new(
                    VecSource::new((0i64..10).collect()),
                ))))) as Box<dyn DataPipe<i64>>,
                Box::new(ShardingFilter::new(Box::new(VecSource::new(
                    (10..20).collect(),
                )))),
            ]))
        };
        let pool = WorkerPool::spawn(2, 4, 1, 0, factory).unwrap();

        let mut items = pool.run_epoch(42).unwrap();
        items.sort_unstable();
        assert_eq!(items, (0..20).collect::<Vec<_>>());
        assert_eq!(pool.dispatch_resets_served(), 1);

        pool.run_epoch(43).unwrap();
        assert_eq!(pool.dispatch_resets_served(), 2);
    }

    #[test]
    fn worker_errors_surface_after_the_epoch_drains() {
        struct Failing;
        impl DataPipe<i64> for Failing {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn next(&mut self) -> Result<Option<i64>> {
                bail!("source exploded")
            }
        }
        let pool = WorkerPool::spawn(2, 4, 1, 0, || Box::new(Failing) as Box<dyn DataPipe<i64>>)
            .unwrap();
        let error = pool.run_epoch(42).unwrap_err();
        assert!(format!("{error:#}").contains("source exploded"));
    }
}
