//! ssrlocal Crypto
//!
//! Digest, HMAC and checksum helpers, the padding RNG, and the
//! SSR stream-cipher layer (key schedule, per-direction cipher
//! contexts with IV handling, IV replay cache).

pub mod digest;
mod rng;
mod stream;

pub use rng::Xorshift128Plus;
pub use stream::{CipherCtx, CipherEnv, CipherError, CipherKind};
