//! The per-call context: the search RNG and the hyperparameter space.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sl_types::SearchSpace;

/// Deterministic random stream shared by every decision of one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRng {
    inner: ChaCha8Rng,
}

/// Exact position of a [`SearchRng`], enough to resume the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: [u8; 32],
    pub stream: u64,
    pub word_pos_hi: u64,
    pub word_pos_lo: u64,
}

impl SearchRng {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn state(&self) -> RngState {
        let word_pos = self.inner.get_word_pos();
        RngState {
            seed: self.inner.get_seed(),
            stream: self.inner.get_stream(),
            word_pos_hi: (word_pos >> 64) as u64,
            word_pos_lo: word_pos as u64,
        }
    }

    pub fn from_state(state: &RngState) -> Self {
        let mut inner = ChaCha8Rng::from_seed(state.seed);
        inner.set_stream(state.stream);
        inner.set_word_pos((u128::from(state.word_pos_hi) << 64) | u128::from(state.word_pos_lo));
        Self { inner }
    }
}

impl RngCore for SearchRng {
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

/// Everything a search method may consult besides its own state.
pub struct Context<'a> {
    pub rng: &'a mut SearchRng,
    pub space: &'a SearchSpace,
}

impl<'a> Context<'a> {
    pub fn new(rng: &'a mut SearchRng, space: &'a SearchSpace) -> Self {
        Self { rng, space }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn state_round_trip_resumes_stream() {
        let mut rng = SearchRng::seed_from_u64(42);
        for _ in 0..17 {
            let _: u64 = rng.gen();
        }
        let state = rng.state();
        let json = serde_json::to_string(&state).unwrap();
        let mut resumed = SearchRng::from_state(&serde_json::from_str(&json).unwrap());

        let expected: Vec<u32> = (0..10).map(|_| rng.gen()).collect();
        let actual: Vec<u32> = (0..10).map(|_| resumed.gen()).collect();
        assert_eq!(expected, actual);
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = SearchRng::seed_from_u64(9);
        let mut b = SearchRng::seed_from_u64(9);
        assert_eq!(a.gen::<f64>(), b.gen::<f64>());
    }
}
