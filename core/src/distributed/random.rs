//! Model-parallel random number streams.
//!
//! Dropout must draw the same mask on every rank when it acts on a replicated activation, and
//! independent masks when it acts on a partitioned one. [`RngTracker`] keeps one stream for each
//! case.

use rand::SeedableRng;
use rand::rngs::StdRng;

/// Offset added to the seed of the model-parallel stream.
pub const MODEL_PARALLEL_SEED_OFFSET: u64 = 2718;

/// Which of the two streams a dropout call draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngStream {
    /// Identical on every rank.
    Default,
    /// Distinct per rank.
    ModelParallel,
}

#[derive(Debug, Clone)]
pub struct RngTracker {
    default: StdRng,
    model_parallel: StdRng,
}

impl RngTracker {
    /// Seeds `default` with `seed` and `model_parallel` with `seed + 2718 + rank`.
    pub fn new(seed: u64, rank: usize) -> Self {
        let mp_seed = seed
            .wrapping_add(MODEL_PARALLEL_SEED_OFFSET)
            .wrapping_add(rank as u64);
        Self {
            default: StdRng::seed_from_u64(seed),
            model_parallel: StdRng::seed_from_u64(mp_seed),
        }
    }

    pub fn get(&mut self, stream: RngStream) -> &mut StdRng {
        match stream {
            RngStream::Default => &mut self.default,
            RngStream::ModelParallel => &mut self.model_parallel,
        }
    }
}
