//! src/graph/settings.rs
//!
//! Graph-wide application of sharding, seeds, and iteration resets.
//!
//! These walks are the only way the worker glue mutates a pipe graph. All
//! of them visit stages in preorder, so workers holding structurally
//! identical graphs make identical per-stage decisions.

use anyhow::{ensure, Result};

use super::{contains_pipe, for_each_pipe, DataPipe, ShardingPriority};
use crate::seed::SeedGenerator;

/// Installs `(num_shards, shard_id)` at `priority` on every shardable stage
/// in the graph.
pub fn apply_sharding<T: Send>(
    root: &mut dyn DataPipe<T>,
    num_shards: usize,
    shard_id: usize,
    priority: ShardingPriority,
) -> Result<()> {
    ensure!(num_shards > 0, "num_shards must be > 0");
    ensure!(
        shard_id < num_shards,
        "shard_id {} out of range for {} shards",
        shard_id,
        num_shards
    );
    let mut outcome = Ok(());
    for_each_pipe(root, &mut |pipe| {
        if outcome.is_ok() && pipe.is_shardable() {
            outcome = pipe.apply_sharding(num_shards, shard_id, priority);
        }
    });
    outcome
}

/// Installs sharding only on replicable branches of a graph containing a
/// dispatch stub.
///
/// A stage whose subtree contains the stub consumes dispatcher output that
/// is already shared across workers, so sharding it would drop items; such
/// stages are skipped and the walk recurses into their upstreams instead.
/// Every subtree disjoint from the stub is sharded in full.
pub fn apply_sharding_to_replicable_branches<T: Send>(
    root: &mut dyn DataPipe<T>,
    num_shards: usize,
    shard_id: usize,
    priority: ShardingPriority,
) -> Result<()> {
    if contains_pipe(root, &|pipe| pipe.is_dispatch_stub()) {
        for upstream in root.upstreams_mut() {
            apply_sharding_to_replicable_branches(
                upstream.as_mut(),
                num_shards,
                shard_id,
                priority,
            )?;
        }
        Ok(())
    } else {
        apply_sharding(root, num_shards, shard_id, priority)
    }
}

/// Installs a derived seed on every seedable stage, in preorder, so the
/// same generator state always lands the same per-stage seeds.
pub fn apply_random_seed<T: Send>(root: &mut dyn DataPipe<T>, seeds: &mut SeedGenerator) {
    for_each_pipe(root, &mut |pipe| {
        if pipe.is_seedable() {
            pipe.apply_seed(seeds.next_seed());
        }
    });
}

/// Restarts iteration state on every stage for a new pass.
pub fn reset_graph<T: Send>(root: &mut dyn DataPipe<T>) {
    for_each_pipe(root, &mut |pipe| pipe.reset());
}
