//! src/graph/pipes.rs
//!
//! Concrete pipeline stages.
//!
//! These cover the stage shapes the worker glue has to handle: a random
//! access source, a transform, a deterministic shuffler, the priority-aware
//! sharding filter, a fan-in, and the marker wrapping the single branch
//! that must run in the dispatch process.

use anyhow::{bail, ensure, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use super::{DataPipe, ShardingPriority};

// ============================================================================
/// Source stage yielding clones of an in-memory vector, in order.
pub struct VecSource<T> {
    items: Vec<T>,
    cursor: usize,
}

impl<T: Clone + Send> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, cursor: 0 }
    }
}

impl<T: Clone + Send> DataPipe<T> for VecSource<T> {
    fn name(&self) -> &'static str {
        "vec_source"
    }

    fn next(&mut self) -> Result<Option<T>> {
        match self.items.get(self.cursor) {
            Some(item) => {
                self.cursor += 1;
                Ok(Some(item.clone()))
            }
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

// ============================================================================
/// Applies a transform to every upstream item.
pub struct Mapper<T: Send, F: FnMut(T) -> T + Send> {
    upstream: Box<dyn DataPipe<T>>,
    transform: F,
}

impl<T: Send, F: FnMut(T) -> T + Send> Mapper<T, F> {
    pub fn new(upstream: Box<dyn DataPipe<T>>, transform: F) -> Self {
        Self {
            upstream,
            transform,
        }
    }
}

impl<T: Send, F: FnMut(T) -> T + Send> DataPipe<T> for Mapper<T, F> {
    fn name(&self) -> &'static str {
        "mapper"
    }

    fn next(&mut self) -> Result<Option<T>> {
        Ok(self.upstream.next()?.map(&mut self.transform))
    }

    fn upstreams(&self) -> &[Box<dyn DataPipe<T>>] {
        std::slice::from_ref(&self.upstream)
    }

    fn upstreams_mut(&mut self) -> &mut [Box<dyn DataPipe<T>>] {
        std::slice::from_mut(&mut self.upstream)
    }
}

// ============================================================================
/// Buffers the whole upstream and yields it in a deterministic shuffled
/// order.
///
/// The shuffle order is fixed by the installed seed: the per-epoch seed walk
/// (`apply_random_seed`) installs one derived from the distributed shared
/// seed, so every worker holding a replica of this stage shuffles
/// identically and a downstream [`ShardingFilter`] then selects disjoint
/// subsets. Without an installed seed the order is random per pass.
pub struct Shuffler<T: Send> {
    upstream: Box<dyn DataPipe<T>>,
    seed: Option<u64>,
    buffer: Vec<T>,
    filled: bool,
}

impl<T: Send> Shuffler<T> {
    pub fn new(upstream: Box<dyn DataPipe<T>>) -> Self {
        Self {
            upstream,
            seed: None,
            buffer: Vec::new(),
            filled: false,
        }
    }
}

impl<T: Send> DataPipe<T> for Shuffler<T> {
    fn name(&self) -> &'static str {
        "shuffler"
    }

    fn next(&mut self) -> Result<Option<T>> {
        if !self.filled {
            let mut items = Vec::new();
            while let Some(item) = self.upstream.next()? {
                items.push(item);
            }
            let mut rng = match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::seed_from_u64(rand::rng().random()),
            };
            items.shuffle(&mut rng);
            // Popped from the back, so reverse to preserve shuffle order.
            items.reverse();
            self.buffer = items;
            self.filled = true;
        }
        Ok(self.buffer.pop())
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.filled = false;
    }

    fn upstreams(&self) -> &[Box<dyn DataPipe<T>>] {
        std::slice::from_ref(&self.upstream)
    }

    fn upstreams_mut(&mut self) -> &mut [Box<dyn DataPipe<T>>] {
        std::slice::from_mut(&mut self.upstream)
    }

    fn apply_seed(&mut self, seed: u64) {
        self.seed = Some(seed);
    }

    fn is_seedable(&self) -> bool {
        true
    }
}

// ============================================================================
/// Round-robin sharding stage.
///
/// Keeps every `num_instances`-th item starting at `instance_id`, where both
/// values are composed from the per-priority groups installed through
/// `apply_sharding`. With groups `(n1, i1)` at a lower priority and
/// `(n2, i2)` at a higher one, the effective split is
/// `(n1 * n2, i1 * n2 + i2)`: the higher-priority group subdivides each
/// lower-priority shard.
pub struct ShardingFilter<T: Send> {
    upstream: Box<dyn DataPipe<T>>,
    groups: BTreeMap<ShardingPriority, (usize, usize)>,
    num_instances: usize,
    instance_id: usize,
    position: usize,
}

impl<T: Send> ShardingFilter<T> {
    pub fn new(upstream: Box<dyn DataPipe<T>>) -> Self {
        Self {
            upstream,
            groups: BTreeMap::new(),
            num_instances: 1,
            instance_id: 0,
            position: 0,
        }
    }

    fn recompute(&mut self) {
        let mut num_instances = 1;
        let mut instance_id = 0;
        for &(group_size, group_id) in self.groups.values() {
            instance_id = instance_id * group_size + group_id;
            num_instances *= group_size;
        }
        self.num_instances = num_instances;
        self.instance_id = instance_id;
    }
}

impl<T: Send> DataPipe<T> for ShardingFilter<T> {
    fn name(&self) -> &'static str {
        "sharding_filter"
    }

    fn next(&mut self) -> Result<Option<T>> {
        loop {
            match self.upstream.next()? {
                Some(item) => {
                    let position = self.position;
                    self.position += 1;
                    if position % self.num_instances == self.instance_id {
                        return Ok(Some(item));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn upstreams(&self) -> &[Box<dyn DataPipe<T>>] {
        std::slice::from_ref(&self.upstream)
    }

    fn upstreams_mut(&mut self) -> &mut [Box<dyn DataPipe<T>>] {
        std::slice::from_mut(&mut self.upstream)
    }

    fn apply_sharding(
        &mut self,
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
        if let Some(&existing) = self.groups.get(&priority) {
            if existing != (num_shards, shard_id) {
                bail!(
                    "conflicting sharding at priority {:?}: {:?} already installed, got ({}, {})",
                    priority,
                    existing,
                    num_shards,
                    shard_id
                );
            }
        }
        self.groups.insert(priority, (num_shards, shard_id));
        self.recompute();
        Ok(())
    }

    fn is_shardable(&self) -> bool {
        true
    }
}

// ============================================================================
/// Fan-in stage draining each upstream in turn.
pub struct Concat<T: Send> {
    upstreams: Vec<Box<dyn DataPipe<T>>>,
    active: usize,
}

impl<T: Send> Concat<T> {
    pub fn new(upstreams: Vec<Box<dyn DataPipe<T>>>) -> Self {
        Self {
            upstreams,
            active: 0,
        }
    }
}

impl<T: Send> DataPipe<T> for Concat<T> {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn next(&mut self) -> Result<Option<T>> {
        while self.active < self.upstreams.len() {
            if let Some(item) = self.upstreams[self.active].next()? {
                return Ok(Some(item));
            }
            self.active += 1;
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.active = 0;
    }

    fn upstreams(&self) -> &[Box<dyn DataPipe<T>>] {
        &self.upstreams
    }

    fn upstreams_mut(&mut self) -> &mut [Box<dyn DataPipe<T>>] {
        &mut self.upstreams
    }
}

// ============================================================================
/// Marks its subtree as the single branch that must not be replicated
/// across workers.
///
/// Use this for stages that cannot be forked, such as a source holding an
/// exclusive handle. The worker pool extracts the marked subtree into the
/// dispatcher thread and each worker reads its output through a queue
/// consumer instead.
pub struct NonReplicable<T: Send> {
    upstream: Box<dyn DataPipe<T>>,
}

impl<T: Send> NonReplicable<T> {
    pub fn new(upstream: Box<dyn DataPipe<T>>) -> Self {
        Self { upstream }
    }
}

impl<T: Send> DataPipe<T> for NonReplicable<T> {
    fn name(&self) -> &'static str {
        "non_replicable"
    }

    fn next(&mut self) -> Result<Option<T>> {
        self.upstream.next()
    }

    fn upstreams(&self) -> &[Box<dyn DataPipe<T>>] {
        std::slice::from_ref(&self.upstream)
    }

    fn upstreams_mut(&mut self) -> &mut [Box<dyn DataPipe<T>>] {
        std::slice::from_mut(&mut self.upstream)
    }

    fn is_replicable(&self) -> bool {
        false
    }
}
