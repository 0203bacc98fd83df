//! src/dispatch.rs
//!
//! Queue-based dispatch of a non-replicable pipeline branch.
//!
//! Most pipeline stages are replicated into every worker and sharded there.
//! A branch marked [`NonReplicable`](crate::graph::NonReplicable) cannot be:
//! it is extracted once, handed to a dedicated dispatcher thread, and every
//! worker reads its output through a pair of bounded channels (one request
//! queue in, one response queue out). Inside each worker graph the extracted
//! branch is first replaced by a [`DispatchStub`] placeholder and then, in
//! `initialize_worker`, by a [`QueueConsumer`] wired to that worker's queue
//! pair.
//!
//! # Epoch protocol
//! Epochs are counted on both sides. A consumer advances its count on
//! `reset`; the dispatcher advances on `ResetEpoch` (sent once per epoch,
//! by worker 0 only). Every `Next` carries the consumer's count, and the
//! dispatcher parks any pull from an epoch it has not been reseeded for,
//! answering it right after that epoch's `ResetEpoch` lands. This gives the
//! ordering guarantee that the dispatch branch is reseeded before any
//! worker consumes from it — in every epoch, not just the first — without
//! any locking beyond the channels themselves.

use anyhow::{anyhow, bail, ensure, Context, Result};
use crossbeam_channel::{bounded, Receiver, Select, Sender};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::graph::{count_pipes, replace_pipe, reset_graph, DataPipe, DispatchConsumer};
use crate::worker::dispatch_reset;

/// How often the dispatcher checks the shutdown flag while idle.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Worker-to-dispatcher messages.
#[derive(Debug)]
pub enum DispatchRequest {
    /// Pull one item from the dispatch branch, for the sender's `epoch`.
    /// Parked until the dispatcher has been reseeded that many times.
    Next { epoch: u64 },
    /// Reseed the branch for a new epoch from the distributed shared seed.
    ResetEpoch { shared_seed: u64 },
}

/// Dispatcher-to-worker messages.
#[derive(Debug)]
pub enum DispatchResponse<T> {
    Item(T),
    /// The dispatch branch is exhausted for this epoch.
    End,
    /// Acknowledges a `ResetEpoch`.
    ResetAck,
    /// The dispatch branch failed; the formatted error chain.
    Error(String),
}

// ============================================================================
/// Worker-side handles for one worker's pair of dispatcher queues.
pub struct QueueClient<T> {
    request_tx: Sender<DispatchRequest>,
    response_rx: Receiver<DispatchResponse<T>>,
}

impl<T> QueueClient<T> {
    /// Builds a client from an existing queue pair. Normal use goes through
    /// [`Dispatcher::take_client`]; this constructor exists for wiring a
    /// custom dispatch loop.
    pub fn new(
        request_tx: Sender<DispatchRequest>,
        response_rx: Receiver<DispatchResponse<T>>,
    ) -> Self {
        Self {
            request_tx,
            response_rx,
        }
    }

    fn request(&self, request: DispatchRequest) -> Result<DispatchResponse<T>> {
        self.request_tx
            .send(request)
            .map_err(|_| anyhow!("dispatch process is gone (request queue closed)"))?;
        self.response_rx
            .recv()
            .map_err(|_| anyhow!("dispatch process is gone (response queue closed)"))
    }
}

// ============================================================================
/// The pipe substituted for a non-replicable branch inside a worker graph.
///
/// Pulls items from the dispatcher one request at a time. Which worker
/// receives which item depends on request arrival order; the union of all
/// workers' pulls is the branch's full output for the epoch.
pub struct QueueConsumer<T: Send> {
    client: QueueClient<T>,
    exhausted: bool,
    // Counts this consumer's epoch resets; tags every pull so the
    // dispatcher can tell a fresh epoch's pull from a stale one.
    epoch: u64,
}

impl<T: Send> QueueConsumer<T> {
    pub fn new(client: QueueClient<T>) -> Self {
        Self {
            client,
            exhausted: false,
            epoch: 0,
        }
    }
}

impl<T: Send> DataPipe<T> for QueueConsumer<T> {
    fn name(&self) -> &'static str {
        "queue_consumer"
    }

    fn next(&mut self) -> Result<Option<T>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.client.request(DispatchRequest::Next { epoch: self.epoch })? {
            DispatchResponse::Item(item) => Ok(Some(item)),
            DispatchResponse::End => {
                self.exhausted = true;
                Ok(None)
            }
            DispatchResponse::Error(message) => {
                bail!("dispatch branch failed: {message}")
            }
            DispatchResponse::ResetAck => {
                bail!("protocol error: unexpected reset acknowledgement")
            }
        }
    }

    fn reset(&mut self) {
        self.exhausted = false;
        self.epoch += 1;
    }

    fn as_dispatch_consumer(&mut self) -> Option<&mut dyn DispatchConsumer> {
        Some(self)
    }
}

impl<T: Send> DispatchConsumer for QueueConsumer<T> {
    fn reset_epoch(&mut self, shared_seed: u64) -> Result<()> {
        match self.client.request(DispatchRequest::ResetEpoch { shared_seed })? {
            DispatchResponse::ResetAck => Ok(()),
            other => bail!(
                "protocol error: expected reset acknowledgement, got {:?}",
                std::mem::discriminant(&other)
            ),
        }
    }
}

// ============================================================================
/// Placeholder standing where a non-replicable branch was cut out.
///
/// Only exists between extraction and `initialize_worker`; iterating one is
/// a wiring bug.
pub struct DispatchStub<T> {
    _marker: PhantomData<T>,
}

impl<T> DispatchStub<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for DispatchStub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> DataPipe<T> for DispatchStub<T> {
    fn name(&self) -> &'static str {
        "dispatch_stub"
    }

    fn next(&mut self) -> Result<Option<T>> {
        bail!("dispatch stub must be replaced by a queue consumer before iteration")
    }

    fn is_dispatch_stub(&self) -> bool {
        true
    }
}

// ============================================================================
/// Cuts the single non-replicable branch out of `root`, leaving a
/// [`DispatchStub`] in its place, and returns the branch. Returns `None`
/// for a fully replicable graph.
pub fn extract_non_replicable<T: Send + 'static>(
    root: &mut Box<dyn DataPipe<T>>,
) -> Result<Option<Box<dyn DataPipe<T>>>> {
    let marked = count_pipes(root.as_ref(), &|pipe| !pipe.is_replicable());
    if marked == 0 {
        return Ok(None);
    }
    ensure!(
        marked == 1,
        "found {} non-replicable branches, at most one is supported",
        marked
    );
    let stub: Box<dyn DataPipe<T>> = Box::new(DispatchStub::new());
    let branch = replace_pipe(root, &|pipe| !pipe.is_replicable(), stub);
    debug_assert!(branch.is_some());
    Ok(branch)
}

// ============================================================================
/// The dispatch "process": a dedicated thread owning a non-replicable
/// branch and serving every worker through per-worker queue pairs.
pub struct Dispatcher<T: Send> {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    resets_served: Arc<AtomicUsize>,
    clients: Vec<Option<QueueClient<T>>>,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Spawns the dispatcher thread for `num_workers` workers. Each queue
    /// holds at most `buffer_size` messages.
    pub fn spawn(
        branch: Box<dyn DataPipe<T>>,
        num_workers: usize,
        buffer_size: usize,
    ) -> Result<Self> {
        ensure!(num_workers > 0, "dispatcher needs at least one worker");
        ensure!(buffer_size > 0, "queue buffer size must be > 0");

        let mut clients = Vec::with_capacity(num_workers);
        let mut request_rxs = Vec::with_capacity(num_workers);
        let mut response_txs = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (request_tx, request_rx) = bounded(buffer_size);
            let (response_tx, response_rx) = bounded(buffer_size);
            clients.push(Some(QueueClient::new(request_tx, response_rx)));
            request_rxs.push(request_rx);
            response_txs.push(response_tx);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let resets_served = Arc::new(AtomicUsize::new(0));

        let shutdown_flag = shutdown.clone();
        let resets = resets_served.clone();
        let handle = thread::Builder::new()
            .name("datapipe-dispatcher".to_string())
            .spawn(move || serve(branch, request_rxs, response_txs, shutdown_flag, resets))
            .context("Failed to spawn dispatcher thread")?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            resets_served,
            clients,
        })
    }

    /// Hands out the queue pair for `worker_id`. Each pair can be taken
    /// exactly once.
    pub fn take_client(&mut self, worker_id: usize) -> Result<QueueClient<T>> {
        ensure!(
            worker_id < self.clients.len(),
            "worker id {} out of range for {} workers",
            worker_id,
            self.clients.len()
        );
        self.clients[worker_id]
            .take()
            .ok_or_else(|| anyhow!("queue client for worker {} already taken", worker_id))
    }

    /// Number of epoch reseeds handled so far.
    pub fn resets_served(&self) -> usize {
        self.resets_served.load(Ordering::Relaxed)
    }

    /// Signals the serve loop to stop. Parked pulls are answered with `End`
    /// first, so a worker blocked on the dispatcher can wake up and observe
    /// its own shutdown. Called by the worker pool before it joins its
    /// workers; dropping the dispatcher signals and joins in one step.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl<T: Send> Drop for Dispatcher<T> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Drop untaken clients so the serve loop sees closed queues.
        self.clients.clear();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve<T: Send>(
    mut branch: Box<dyn DataPipe<T>>,
    request_rxs: Vec<Receiver<DispatchRequest>>,
    response_txs: Vec<Sender<DispatchResponse<T>>>,
    shutdown: Arc<AtomicBool>,
    resets_served: Arc<AtomicUsize>,
) {
    let mut live: Vec<bool> = vec![true; request_rxs.len()];
    let mut current_epoch: u64 = 0;
    let mut parked_next: VecDeque<(usize, u64)> = VecDeque::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            // Wake parked workers so they can observe the shutdown.
            for (parked, _) in parked_next.drain(..) {
                if live[parked] {
                    let _ = response_txs[parked].send(DispatchResponse::End);
                }
            }
            break;
        }

        // Select over the queues of workers that are still connected.
        let mut select = Select::new();
        let mut registered = Vec::new();
        for (worker, request_rx) in request_rxs.iter().enumerate() {
            if live[worker] {
                registered.push(worker);
                select.recv(request_rx);
            }
        }
        if registered.is_empty() {
            break;
        }

        let operation = match select.select_timeout(IDLE_POLL) {
            Ok(operation) => operation,
            Err(_) => continue,
        };
        let worker = registered[operation.index()];
        let request = match operation.recv(&request_rxs[worker]) {
            Ok(request) => request,
            Err(_) => {
                live[worker] = false;
                continue;
            }
        };

        match request {
            DispatchRequest::ResetEpoch { shared_seed } => {
                dispatch_reset(branch.as_mut(), shared_seed);
                reset_graph(branch.as_mut());
                current_epoch += 1;
                resets_served.fetch_add(1, Ordering::Relaxed);
                if response_txs[worker].send(DispatchResponse::ResetAck).is_err() {
                    live[worker] = false;
                }
                // Answer pulls that raced ahead of this epoch's reseed.
                let mut still_parked = VecDeque::new();
                while let Some((parked, epoch)) = parked_next.pop_front() {
                    if epoch > current_epoch {
                        still_parked.push_back((parked, epoch));
                    } else if live[parked] && !answer_next(&mut branch, &response_txs[parked]) {
                        live[parked] = false;
                    }
                }
                parked_next = still_parked;
            }
            DispatchRequest::Next { epoch } => {
                if epoch > current_epoch {
                    parked_next.push_back((worker, epoch));
                } else if !answer_next(&mut branch, &response_txs[worker]) {
                    live[worker] = false;
                }
            }
        }
    }
}

/// Serves one item to a worker; false when that worker's queue is closed.
fn answer_next<T: Send>(
    branch: &mut Box<dyn DataPipe<T>>,
    response_tx: &Sender<DispatchResponse<T>>,
) -> bool {
    let response = match branch.next() {
        Ok(Some(item)) => DispatchResponse::Item(item),
        Ok(None) => DispatchResponse::End,
        Err(error) => DispatchResponse::Error(format!("{error:#}")),
    };
    response_tx.send(response).is_ok()
}

// ============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NonReplicable, Shuffler, VecSource};

    fn dispatch_branch(n: i64) -> Box<dyn DataPipe<i64>> {
        Box::new(NonReplicable::new(Box::new(Shuffler::new(Box::new(
            VecSource::new((0..n).collect()),
        )))))
    }

    mod extraction_tests {
        use super::*;
        use crate::graph::{contains_pipe, Concat, Mapper};

        #[test]
        fn fully_replicable_graph_is_untouched() {
            let mut pipe: Box<dyn DataPipe<i64>> =
                Box::new(Mapper::new(Box::new(VecSource::new(vec![1])), |x: i64| x));
            assert!(extract_non_replicable(&mut pipe).unwrap().is_none());
            assert!(!contains_pipe(pipe.as_ref(), &|p| p.is_dispatch_stub()));
        }

        #[test]
        fn marked_branch_is_swapped_for_a_stub() {
            let mut pipe: Box<dyn DataPipe<i64>> = Box::new(Concat::new(vec![
                dispatch_branch(4),
                Box::new(VecSource::new(vec![9i64])) as Box<dyn DataPipe<i64>>,
            ]));
            let branch = extract_non_replicable(&mut pipe).unwrap();
            assert_eq!(branch.map(|b| b.name()), Some("non_replicable"));
            assert!(contains_pipe(pipe.as_ref(), &|p| p.is_dispatch_stub()));
        }

        #[test]
        fn two_marked_branches_are_rejected() {
            let mut pipe: Box<dyn DataPipe<i64>> =
                Box::new(Concat::new(vec![dispatch_branch(2), dispatch_branch(2)]));
            assert!(extract_non_replicable(&mut pipe).is_err());
        }
    }

    mod stub_tests {
        use super::*;

        #[test]
        fn iterating_a_stub_is_an_error() {
            let mut stub = DispatchStub::<i64>::new();
            assert!(stub.next().is_err());
            assert!(stub.is_dispatch_stub());
        }
    }

    mod dispatcher_tests {
        use super::*;

        fn pull_all(consumer: &mut QueueConsumer<i64>) -> Vec<i64> {
            let mut items = Vec::new();
            while let Some(item) = consumer.next().unwrap() {
                items.push(item);
            }
            items
        }

        #[test]
        fn serves_each_item_exactly_once_across_workers() {
            let mut dispatcher = Dispatcher::spawn(dispatch_branch(20), 2, 4).unwrap();
            let mut first = QueueConsumer::new(dispatcher.take_client(0).unwrap());
            let mut second = QueueConsumer::new(dispatcher.take_client(1).unwrap());

            first.reset_epoch(42).unwrap();
            let mut items = pull_all(&mut first);
            items.extend(pull_all(&mut second));
            items.sort_unstable();
            assert_eq!(items, (0..20).collect::<Vec<_>>());
            assert_eq!(dispatcher.resets_served(), 1);
        }

        #[test]
        fn pulls_before_the_reseed_are_parked_until_it_lands() {
            let mut dispatcher = Dispatcher::spawn(dispatch_branch(4), 2, 4).unwrap();
            let eager_client = dispatcher.take_client(1).unwrap();
            // Worker 1 asks for an item of epoch 1 before any reseed
            // happened; the request must be parked, not answered from
            // unseeded state.
            eager_client
                .request_tx
                .send(DispatchRequest::Next { epoch: 1 })
                .unwrap();
            assert!(eager_client
                .response_rx
                .recv_timeout(Duration::from_millis(200))
                .is_err());

            let mut first = QueueConsumer::new(dispatcher.take_client(0).unwrap());
            first.reset_epoch(7).unwrap();
            match eager_client.response_rx.recv().unwrap() {
                DispatchResponse::Item(_) => {}
                other => panic!("expected a parked item, got {other:?}"),
            }
        }

        #[test]
        fn later_epoch_pulls_wait_for_that_epochs_reseed() {
            let mut dispatcher = Dispatcher::spawn(dispatch_branch(6), 2, 4).unwrap();
            let mut first = QueueConsumer::new(dispatcher.take_client(0).unwrap());
            let second_client = dispatcher.take_client(1).unwrap();

            first.reset_epoch(7).unwrap();
            assert_eq!(pull_all(&mut first).len(), 6);

            // Worker 1 starts the second epoch before worker 0's reseed
            // arrives: its pull must wait for that reseed, not be answered
            // from the drained first epoch.
            second_client
                .request_tx
                .send(DispatchRequest::Next { epoch: 2 })
                .unwrap();
            assert!(second_client
                .response_rx
                .recv_timeout(Duration::from_millis(200))
                .is_err());

            first.reset();
            first.reset_epoch(7).unwrap();
            match second_client.response_rx.recv().unwrap() {
                DispatchResponse::Item(_) => {}
                other => panic!("expected an item from the fresh epoch, got {other:?}"),
            }
            assert_eq!(dispatcher.resets_served(), 2);
        }

        #[test]
        fn same_shared_seed_reproduces_the_epoch_order() {
            let run = |seed: u64| -> Vec<i64> {
                let mut dispatcher = Dispatcher::spawn(dispatch_branch(16), 1, 4).unwrap();
                let mut consumer = QueueConsumer::new(dispatcher.take_client(0).unwrap());
                consumer.reset_epoch(seed).unwrap();
                pull_all(&mut consumer)
            };
            assert_eq!(run(42), run(42));
            assert_ne!(run(42), run(1337));
        }

        #[test]
        fn reseeding_again_starts_a_fresh_epoch() {
            let mut dispatcher = Dispatcher::spawn(dispatch_branch(8), 1, 4).unwrap();
            let mut consumer = QueueConsumer::new(dispatcher.take_client(0).unwrap());

            consumer.reset_epoch(42).unwrap();
            let first_epoch = pull_all(&mut consumer);

            consumer.reset();
            consumer.reset_epoch(42).unwrap();
            assert_eq!(pull_all(&mut consumer), first_epoch);
            assert_eq!(dispatcher.resets_served(), 2);
        }

        #[test]
        fn client_queues_can_be_taken_once() {
            let mut dispatcher = Dispatcher::spawn(dispatch_branch(2), 1, 2).unwrap();
            assert!(dispatcher.take_client(0).is_ok());
            assert!(dispatcher.take_client(0).is_err());
            assert!(dispatcher.take_client(5).is_err());
        }
    }
}
