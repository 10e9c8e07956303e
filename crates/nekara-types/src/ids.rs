//! Identity service: random tokens for node and message ids.
//!
//! Nodes never draw randomness from global state. They are handed an
//! [`IdGenerator`] at construction, so tests can substitute a seeded one.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Mutex;

/// Characters used in generated tokens.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// First value issued by a sequential [`UniqueIds`].
pub const DEFAULT_UNIQUE_OFFSET: u32 = 1_000_001;

/// Source of random id tokens.
pub trait IdGenerator: Send + Sync {
    /// Produce a token of `len` characters from `A-Z0-9`.
    fn token(&self, len: usize) -> String;
}

fn draw<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Entropy-backed generator. The default for production nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn token(&self, len: usize) -> String {
        draw(&mut rand::thread_rng(), len)
    }
}

/// Deterministic generator for reproducible runs.
#[derive(Debug)]
pub struct SeededIds {
    rng: Mutex<StdRng>,
}

impl SeededIds {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn next_string(&self, len: usize) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        draw(&mut *rng, len)
    }

    /// A value in `0..max`, or 0 when `max` is 0.
    pub fn next_int(&self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0..max)
    }

    pub fn next_bool(&self) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_bool(0.5)
    }
}

impl IdGenerator for SeededIds {
    fn token(&self, len: usize) -> String {
        self.next_string(len)
    }
}

#[derive(Debug)]
struct UniqueState {
    issued: HashSet<u32>,
    rng: StdRng,
    sequential: bool,
    offset: u32,
}

/// Issues integers that are never repeated until [`UniqueIds::reset`].
///
/// Sequential mode counts up from an offset; random mode draws from
/// `0..i32::MAX` and retries on collision.
#[derive(Debug)]
pub struct UniqueIds {
    state: Mutex<UniqueState>,
}

impl UniqueIds {
    pub fn sequential(offset: u32) -> Self {
        Self::build(true, offset, 0)
    }

    pub fn random(seed: u64) -> Self {
        Self::build(false, 0, seed)
    }

    fn build(sequential: bool, offset: u32, seed: u64) -> Self {
        Self {
            state: Mutex::new(UniqueState {
                issued: HashSet::new(),
                rng: StdRng::seed_from_u64(seed),
                sequential,
                offset,
            }),
        }
    }

    pub fn generate(&self) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let candidate = if state.sequential {
                state.offset.wrapping_add(state.issued.len() as u32)
            } else {
                state.rng.gen_range(0..i32::MAX as u32)
            };
            if state.issued.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Forget every issued value.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.issued.clear();
    }

    pub fn issued_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.issued.len()
    }
}

impl Default for UniqueIds {
    fn default() -> Self {
        Self::sequential(DEFAULT_UNIQUE_OFFSET)
    }
}
