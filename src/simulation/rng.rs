use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded source for every random choice the simulation makes.
pub struct DeterministicRng {
    rng: ChaCha8Rng,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        DeterministicRng {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Uniform in `[min, max)`; `min` when the range is empty.
    pub fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        min + (self.next_u64() % (max - min))
    }

    pub fn gen_bool(&mut self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        let val = self.next_u64() as f64 / u64::MAX as f64;
        val < probability
    }

    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.gen_range(0, items.len() as u64) as usize;
        items.get(idx)
    }
}
