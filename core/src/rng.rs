// Randomness Handle — explicit, seedable randomness source
//
// Every component that draws randomness (chunk sizing, jitter, cover
// scheduling, KEM ephemerals) takes an `RngHandle` instead of reaching for
// a global generator, so tests can reproduce timing and size decisions by
// injecting a seed.

use rand::rngs::StdRng;
use rand::{CryptoRng, Rng, RngCore, SeedableRng};

/// Owned, seedable CSPRNG handle
pub struct RngHandle {
    inner: StdRng,
}

impl RngHandle {
    /// Seed from operating system entropy
    pub fn from_entropy() -> Self {
        Self {
            inner: StdRng::from_entropy(),
        }
    }

    /// Deterministic handle for reproducible runs
    pub fn from_seed(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    /// Derive an independent child handle (e.g. one per component)
    pub fn fork(&mut self) -> Self {
        let mut seed = [0u8; 32];
        self.inner.fill_bytes(&mut seed);
        Self {
            inner: StdRng::from_seed(seed),
        }
    }

    /// Uniform sample in the open interval (0, 1)
    pub fn u01(&mut self) -> f64 {
        loop {
            let u: f64 = self.inner.gen();
            if u > 0.0 {
                return u;
            }
        }
    }

    /// Uniform sample in [lo, hi)
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        lo + (hi - lo) * self.inner.gen::<f64>()
    }

    /// Uniform integer in [lo, hi] (inclusive)
    pub fn range_inclusive(&mut self, lo: usize, hi: usize) -> usize {
        if hi <= lo {
            return lo;
        }
        self.inner.gen_range(lo..=hi)
    }

    /// Exponential sample with the given rate (events per unit)
    pub fn exp(&mut self, rate: f64) -> f64 {
        -self.u01().ln() / rate.max(1e-9)
    }

    /// Random byte vector of the given length
    pub fn bytes(&mut self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.inner.fill_bytes(&mut out);
        out
    }
}

impl RngCore for RngHandle {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

impl CryptoRng for RngHandle {}

impl std::fmt::Debug for RngHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RngHandle(..)")
    }
}
