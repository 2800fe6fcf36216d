use std::fmt::Display;

use rand::{rngs::StdRng, Rng, SeedableRng};

/// A splittable random key.
///
/// Keys are values: splitting never mutates the parent, and the same key always yields the same
/// children. Use [`PrngKey::rng`] to draw random numbers from a key that will not be split further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrngKey(u64);

impl PrngKey {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn seed(&self) -> u64 {
        self.0
    }

    /// Two-way split. By convention the first key is carried forward and the second is consumed.
    pub fn split(&self) -> (Self, Self) {
        let mut rng = self.rng();
        (Self(rng.gen()), Self(rng.gen()))
    }

    /// Split into `n` independent keys, e.g. one per device.
    pub fn split_n(&self, n: usize) -> Vec<Self> {
        let mut rng = self.rng();
        (0..n).map(|_| Self(rng.gen())).collect()
    }

    /// A generator seeded from this key.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }
}

impl Display for PrngKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrngKey({:#018x})", self.0)
    }
}
