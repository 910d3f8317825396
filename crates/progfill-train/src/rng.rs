//! Seeded RNG streams with split-never-reuse discipline.
//!
//! Each replica owns one stream. A step draws a fresh split for its stochastic
//! work and leaves the stream advanced, so no seed is ever consumed twice.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
pub struct RngStream {
    rng: StdRng,
}

impl RngStream {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Derive a stream for a given host, so multi-host runs draw distinct
    /// randomness from the same base seed.
    pub fn fold_in(seed: u64, host_id: u64) -> Self {
        Self::seeded(seed ^ host_id.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Split off an independent child stream, advancing this one.
    pub fn split(&mut self) -> RngStream {
        RngStream::seeded(self.rng.gen())
    }

    /// Draw a single-use seed, advancing the stream.
    pub fn next_seed(&mut self) -> u64 {
        self.rng.gen()
    }

    pub fn gen_range(&mut self, upper: usize) -> usize {
        self.rng.gen_range(0..upper)
    }
}
