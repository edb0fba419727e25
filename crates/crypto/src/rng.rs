//! Padding-length RNG
//!
//! xorshift128+ as used by the SSR framings for their random padding
//! lengths. Not cryptographically strong; integrity comes from the
//! HMAC layer. Deterministic when built from a fixed seed, which is
//! what the framing tests rely on.

use rand::RngCore;

#[derive(Debug, Clone)]
pub struct Xorshift128Plus {
    state: [u64; 2],
}

impl Xorshift128Plus {
    /// Seed from the OS entropy source.
    pub fn new() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::from_seed([rng.next_u64(), rng.next_u64()])
    }

    /// Fixed seed; the all-zero state is invalid for xorshift and gets
    /// nudged to a constant.
    pub fn from_seed(seed: [u64; 2]) -> Self {
        let state = if seed == [0, 0] {
            [0x10000000, 0x20000000]
        } else {
            seed
        };
        Self { state }
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.state[0];
        let y = self.state[1];
        self.state[0] = y;
        x ^= x << 23;
        x ^= y ^ (x >> 17) ^ (y >> 26);
        self.state[1] = x;
        x.wrapping_add(y)
    }
}

impl Default for Xorshift128Plus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_given_seed() {
        let mut a = Xorshift128Plus::from_seed([1, 2]);
        let mut b = Xorshift128Plus::from_seed([1, 2]);
        for _ in 0..64 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn test_seeds_diverge() {
        let mut a = Xorshift128Plus::from_seed([1, 2]);
        let mut b = Xorshift128Plus::from_seed([3, 4]);
        let va: Vec<u64> = (0..8).map(|_| a.next()).collect();
        let vb: Vec<u64> = (0..8).map(|_| b.next()).collect();
        assert_ne!(va, vb);
    }

    #[test]
    fn test_zero_seed_is_nudged() {
        let mut rng = Xorshift128Plus::from_seed([0, 0]);
        // Must not get stuck at zero.
        assert!((0..8).any(|_| rng.next() != 0));
    }
}
