//! src/graph/mod.rs
//!
//! The composable pipe graph.
//!
//! A pipeline is a tree of [`DataPipe`] stages, each owning its upstream
//! stages and pulling items from them on demand. The worker glue never cares
//! what a stage computes; it only needs four capabilities, all expressed as
//! trait hooks with no-op defaults:
//!
//! - traversal (`upstreams` / `upstreams_mut`) for search and rewrite,
//! - sharding (`apply_sharding`) for splitting a source across workers,
//! - seeding (`apply_seed`) for deterministic per-stage randomness,
//! - replication marking (`is_replicable`) for the one branch that must run
//!   in the dispatch process instead of once per worker.
//!
//! # Module Structure
//!
//! ```text
//! src/graph/
//! ├── mod.rs       # DataPipe trait + traversal/search/rewrite walks
//! ├── pipes.rs     # Concrete stages (sources, shuffler, sharding filter, ...)
//! └── settings.rs  # Graph-wide application of sharding and seeds
//! ```

mod pipes;
mod settings;

pub use pipes::{Concat, Mapper, NonReplicable, ShardingFilter, Shuffler, VecSource};
pub use settings::{
    apply_random_seed, apply_sharding, apply_sharding_to_replicable_branches, reset_graph,
};

use anyhow::Result;

/// Sharding groups recognized by [`ShardingFilter`].
///
/// A filter can be sharded once per priority; the groups compose into a
/// single effective `(num_instances, instance_id)` pair, applied in priority
/// order. Worker-process sharding always uses `Multiprocessing`, leaving the
/// other groups free for schedulers above this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShardingPriority {
    Default,
    DistributedSampling,
    Multiprocessing,
}

/// A composable pipeline stage yielding items of type `T`.
///
/// Stages form a tree: each stage owns its upstreams and drives them from
/// `next`. All graph-wide operations (sharding, seeding, search, rewrite)
/// are preorder walks over that tree, so two workers holding structurally
/// identical graphs always visit stages in the same order.
pub trait DataPipe<T: Send>: Send {
    /// Stage name for error messages and diagnostics.
    fn name(&self) -> &'static str;

    /// Pulls the next item, driving upstream stages as needed.
    fn next(&mut self) -> Result<Option<T>>;

    /// Restarts this stage's own iteration state for a new pass. Upstreams
    /// are reset by the graph walk, not by the stage itself.
    fn reset(&mut self) {}

    fn upstreams(&self) -> &[Box<dyn DataPipe<T>>] {
        &[]
    }

    fn upstreams_mut(&mut self) -> &mut [Box<dyn DataPipe<T>>] {
        &mut []
    }

    /// Records a `(num_shards, shard_id)` split for `priority`. Only called
    /// on stages reporting `is_shardable`.
    fn apply_sharding(
        &mut self,
        _num_shards: usize,
        _shard_id: usize,
        _priority: ShardingPriority,
    ) -> Result<()> {
        Ok(())
    }

    fn is_shardable(&self) -> bool {
        false
    }

    /// Installs a seed for stages with internal randomness. Takes effect on
    /// the next `reset`.
    fn apply_seed(&mut self, _seed: u64) {}

    fn is_seedable(&self) -> bool {
        false
    }

    /// False for the single branch that must run in the dispatch process
    /// rather than being replicated into every worker.
    fn is_replicable(&self) -> bool {
        true
    }

    /// True for the placeholder left where a non-replicable branch was cut
    /// out of the graph.
    fn is_dispatch_stub(&self) -> bool {
        false
    }

    /// Dispatch-consumer view of the queue-backed stand-in pipe, used by the
    /// per-epoch reset walk.
    fn as_dispatch_consumer(&mut self) -> Option<&mut dyn DispatchConsumer> {
        None
    }
}

/// Epoch-level control surface of the queue-backed stand-in pipe.
pub trait DispatchConsumer {
    /// Asks the dispatch process to reseed itself for a new epoch. Sent once
    /// per epoch, by the first worker only, and blocks until acknowledged so
    /// the reseed is ordered before any item pull of that epoch.
    fn reset_epoch(&mut self, shared_seed: u64) -> Result<()>;
}

/// Preorder walk: the stage itself, then its upstreams left to right.
pub fn for_each_pipe<T, F>(root: &mut dyn DataPipe<T>, f: &mut F)
where
    T: Send,
    F: FnMut(&mut dyn DataPipe<T>),
{
    f(root);
    for upstream in root.upstreams_mut() {
        for_each_pipe(upstream.as_mut(), f);
    }
}

/// Counts stages matching `pred`, in preorder.
pub fn count_pipes<T, F>(root: &dyn DataPipe<T>, pred: &F) -> usize
where
    T: Send,
    F: Fn(&dyn DataPipe<T>) -> bool,
{
    let mut count = usize::from(pred(root));
    for upstream in root.upstreams() {
        count += count_pipes(upstream.as_ref(), pred);
    }
    count
}

/// True when any stage in the tree matches `pred`.
pub fn contains_pipe<T, F>(root: &dyn DataPipe<T>, pred: &F) -> bool
where
    T: Send,
    F: Fn(&dyn DataPipe<T>) -> bool,
{
    if pred(root) {
        return true;
    }
    root.upstreams()
        .iter()
        .any(|upstream| contains_pipe(upstream.as_ref(), pred))
}

/// Swaps the first stage (preorder) matching `pred` for `replacement` and
/// returns the replaced subtree. Returns `None` and leaves the graph
/// untouched when no stage matches.
pub fn replace_pipe<T, F>(
    root: &mut Box<dyn DataPipe<T>>,
    pred: &F,
    replacement: Box<dyn DataPipe<T>>,
) -> Option<Box<dyn DataPipe<T>>>
where
    T: Send,
    F: Fn(&dyn DataPipe<T>) -> bool,
{
    let mut slot = Some(replacement);
    replace_first(root, pred, &mut slot)
}

fn replace_first<T, F>(
    root: &mut Box<dyn DataPipe<T>>,
    pred: &F,
    slot: &mut Option<Box<dyn DataPipe<T>>>,
) -> Option<Box<dyn DataPipe<T>>>
where
    T: Send,
    F: Fn(&dyn DataPipe<T>) -> bool,
{
    if pred(root.as_ref()) {
        // The walk stops at the first match, so the slot is still full here.
        let Some(replacement) = slot.take() else {
            return None;
        };
        return Some(std::mem::replace(root, replacement));
    }
    for upstream in root.upstreams_mut() {
        if let Some(old) = replace_first(upstream, pred, slot) {
            return Some(old);
        }
    }
    None
}
