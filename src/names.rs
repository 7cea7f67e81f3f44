//! VM name generation.
//!
//! Every pipeline run provisions a VM under a fresh name. The generator is
//! passed into the compiler explicitly so tests can seed it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NAME_PREFIX: &str = "drone";
const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const NAME_SUFFIX_LEN: usize = 20;

/// Source of unique VM names.
pub trait NameGenerator {
    /// Returns the next name.
    fn next_name(&mut self) -> String;
}

/// Random lowercase alphanumeric names with a fixed prefix.
#[derive(Clone, Debug)]
pub struct RandomNames {
    rng: StdRng,
}

impl RandomNames {
    /// Creates a generator seeded from operating system entropy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Creates a deterministic generator.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomNames {
    fn default() -> Self {
        Self::new()
    }
}

impl NameGenerator for RandomNames {
    fn next_name(&mut self) -> String {
        let mut name = String::with_capacity(NAME_PREFIX.len() + NAME_SUFFIX_LEN);
        name.push_str(NAME_PREFIX);
        for _ in 0..NAME_SUFFIX_LEN {
            let index = self.rng.gen_range(0..NAME_ALPHABET.len());
            if let Some(byte) = NAME_ALPHABET.get(index) {
                name.push(char::from(*byte));
            }
        }
        name
    }
}
