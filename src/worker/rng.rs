//! src/worker/rng.rs
//!
//! Worker-local global random state.
//!
//! Beyond the per-stage seeds installed on the pipe graph, each worker owns
//! "global" random state that user code reaches implicitly: a thread-local
//! RNG for transforms, the tensor framework's generator, and (when the
//! `fastrand` feature is on) the process-wide `fastrand` generator.
//! [`set_global_random_state`] reseeds all of them from one seed stream in a
//! fixed order, so the whole set is reproducible from a single worker seed.

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use std::cell::RefCell;
use std::ops::Range;

use crate::seed::SeedGenerator;

thread_local! {
    /// Thread-local worker ID, assigned when the worker thread is spawned.
    /// Used for task distribution and error messages.
    pub static WORKER_ID: RefCell<usize> = const { RefCell::new(0) };

    /// Thread-local RNG for deterministic randomness in workers.
    pub static WORKER_RNG: RefCell<Option<StdRng>> = const { RefCell::new(None) };
}

/// Tags the current thread with its worker id.
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|worker_id| *worker_id.borrow_mut() = id);
}

/// The current thread's worker id, 0 outside a worker thread.
pub fn worker_id() -> usize {
    WORKER_ID.with(|worker_id| *worker_id.borrow())
}

/// Reseeds every global random subsystem for the current worker thread.
///
/// Draws one seed per subsystem from `seeds`, always in the same order:
/// the thread-local worker RNG, the tensor framework generator, then
/// `fastrand` when that feature is enabled. The `fastrand` draw is narrowed
/// to 32 bits.
pub fn set_global_random_state(seeds: &mut SeedGenerator) {
    WORKER_RNG.with(|rng| {
        *rng.borrow_mut() = Some(StdRng::seed_from_u64(seeds.next_seed()));
    });
    tch::manual_seed(seeds.next_seed() as i64);
    #[cfg(feature = "fastrand")]
    fastrand::seed(u64::from(seeds.next_seed_u32()));
}

/// Reseeds only the thread-local worker RNG. The dispatcher thread uses
/// this instead of [`set_global_random_state`] because it shares the process
/// with the workers and must not touch the process-wide generators they
/// rely on.
pub(crate) fn set_thread_rng(seed: u64) {
    WORKER_RNG.with(|rng| {
        *rng.borrow_mut() = Some(StdRng::seed_from_u64(seed));
    });
}

/// A random bool from the worker RNG, or the thread RNG outside a worker.
/// Used by random transforms to stay deterministic under a fixed seed.
pub fn worker_gen_bool(p: f64) -> bool {
    WORKER_RNG.with(|rng| {
        let mut rng_ref = rng.borrow_mut();
        match rng_ref.as_mut() {
            Some(rng) => rng.random_bool(p),
            None => rand::rng().random_bool(p),
        }
    })
}

/// A random value in `range` from the worker RNG, or the thread RNG outside
/// a worker.
pub fn worker_gen_range(range: Range<u64>) -> u64 {
    WORKER_RNG.with(|rng| {
        let mut rng_ref = rng.borrow_mut();
        match rng_ref.as_mut() {
            Some(rng) => rng.random_range(range),
            None => rand::rng().random_range(range),
        }
    })
}
