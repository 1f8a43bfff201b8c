//! Deterministic key/value generator for scenario tests.
//!
//! Reproduces a classic `rand()` linear congruential generator so a scenario
//! can regenerate the exact key sequence it wrote in order to read or delete
//! it again. Every sequence starts from seed 0.

/// Characters keys are drawn from: printable ASCII from space to `~`.
const KEY_CHARS: &[u8] = b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLM\
NOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// Longest key the generator produces.
pub const MAX_KEY_LEN: usize = 63;

/// `seed = (1103515245 * seed + 12345) & 0x7fffffff`.
#[derive(Debug, Clone)]
pub struct HarnessRng {
    seed: u64,
}

impl HarnessRng {
    /// Creates a generator with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Next value in `0..=0x7fffffff`.
    pub fn next_u32(&mut self) -> u32 {
        self.seed = self.seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff;
        self.seed as u32
    }

    /// A key of exactly `len` characters (clamped to [`MAX_KEY_LEN`]).
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero.
    pub fn name(&mut self, len: usize) -> Vec<u8> {
        assert!(len > 0, "key length must be positive");
        (0..len.min(MAX_KEY_LEN))
            .map(|_| KEY_CHARS[self.next_u32() as usize % KEY_CHARS.len()])
            .collect()
    }

    /// A key whose length is drawn from `min..=max`.
    pub fn key(&mut self, min: usize, max: usize) -> Vec<u8> {
        let len = self.next_u32() as usize % (max - min + 1) + min;
        self.name(len)
    }
}

/// The first `count` keys of the sequence, lengths in `min..=max`.
#[must_use]
pub fn harness_keys(count: usize, min: usize, max: usize) -> Vec<Vec<u8>> {
    let mut rng = HarnessRng::new(0);
    (0..count).map(|_| rng.key(min, max)).collect()
}

/// Value written for the `i`-th key: `i` in upper-case hex.
#[must_use]
pub fn harness_value(i: usize) -> Vec<u8> {
    format!("{i:X}").into_bytes()
}

/// Keys sharing a common prefix, longest first, each with a value twice its
/// length.
#[must_use]
pub fn prefix_pairs() -> Vec<(Vec<u8>, Vec<u8>)> {
    const KEY: &[u8] = b"0123456789ABCDEFGHIJKLMNHOPQRST";
    const VALUE: &[u8] = b"0x1x2x3x4x5x6x7x8x9xAxBxCxDxExFxGxHxIxJxKxLxMxNxHxOxPxQxRxSxTx";

    (5..=20).rev().map(|len| (KEY[..len].to_vec(), VALUE[..2 * len].to_vec())).collect()
}
