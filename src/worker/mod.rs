//! src/worker/mod.rs
//!
//! Per-worker setup of a pipe graph: sharding, dispatch wiring, and seeding.
//!
//! Each worker receives its own copy of the pipe graph plus two small
//! records: [`WorkerInfo`] (its place among the local workers) and
//! [`DistInfo`] (its place among distributed ranks, carrying the epoch's
//! shared seed). [`initialize_worker`] runs once per worker to shard the
//! graph and wire any dispatch queue; [`reset_worker`] runs once per epoch
//! to reseed the graph and the worker's global random state.
//!
//! # Module Structure
//!
//! ```text
//! src/worker/
//! ├── mod.rs     # WorkerInfo / DistInfo records
//! ├── init.rs    # initialize_worker / reset_worker / dispatch_reset
//! ├── rng.rs     # Worker-local global random state
//! └── pool.rs    # WorkerPool: threads + dispatcher orchestration
//! ```

mod init;
mod pool;
mod rng;

pub use init::{dispatch_reset, initialize_worker, reset_worker, CustomWorkerFn};
pub use pool::WorkerPool;
pub use rng::{set_global_random_state, worker_gen_bool, worker_gen_range, worker_id};

use anyhow::{ensure, Result};

/// A worker's position among the workers of one process group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    pub num_workers: usize,
    pub worker_id: usize,
}

impl WorkerInfo {
    pub fn new(num_workers: usize, worker_id: usize) -> Result<Self> {
        ensure!(num_workers > 0, "num_workers must be > 0");
        ensure!(
            worker_id < num_workers,
            "worker_id {} out of range for {} workers",
            worker_id,
            num_workers
        );
        Ok(Self {
            num_workers,
            worker_id,
        })
    }
}

/// A rank's position in the distributed job, plus the epoch's shared seed.
///
/// The shared seed is identical on every rank for a given epoch; everything
/// worker-specific is derived from it here so that the derivation is in one
/// place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistInfo {
    pub shared_seed: u64,
    pub world_size: usize,
    pub rank: usize,
}

impl DistInfo {
    /// Single-process job: one rank, no peers.
    pub fn new(shared_seed: u64) -> Self {
        Self {
            shared_seed,
            world_size: 1,
            rank: 0,
        }
    }

    pub fn with_rank(shared_seed: u64, world_size: usize, rank: usize) -> Result<Self> {
        ensure!(world_size > 0, "world_size must be > 0");
        ensure!(
            rank < world_size,
            "rank {} out of range for world size {}",
            rank,
            world_size
        );
        Ok(Self {
            shared_seed,
            world_size,
            rank,
        })
    }

    /// Job-wide id of a local worker: unique across every worker of every
    /// rank.
    pub fn global_worker_id(&self, worker_id: usize) -> u64 {
        (worker_id * self.world_size + self.rank) as u64
    }

    /// Seed for one worker's process-local random state. Distinct per global
    /// worker id, deterministic in the shared seed.
    pub fn worker_seed(&self, worker_id: usize) -> u64 {
        self.shared_seed.wrapping_add(self.global_worker_id(worker_id))
    }
}
