//! Circuit-creation handshakes.
//!
//! A handshake exchanges one message in each direction with a target
//! relay, and yields the key material used to initialize that hop's
//! [cell-crypto layers](crate::crypto::cell).
//!
//! Only the "fast" handshake (no public key operations, first hop only)
//! is implemented here; other handshakes are carried as opaque bodies in
//! CREATE2/EXTEND2 messages and can be slotted in behind the same
//! [`KeyGenerator`] seam.

pub mod fast;

use crate::Result;

use digest::Digest;
use sha1::Sha1;

/// An object that can expand a shared secret into an arbitrary amount of
/// key material.
pub trait KeyGenerator {
    /// Consume the generator and return `keylen` bytes of key material.
    fn expand(self, keylen: usize) -> Result<Vec<u8>>;
}

/// Expand `seed` into `n` bytes of key material with the legacy
/// counter-hash KDF: `K = H(K0 | [0]) | H(K0 | [1]) | ...`.
pub(crate) fn legacy_kdf(seed: &[u8], n: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(n + 20);
    let mut counter = 0_u8;
    while result.len() < n {
        let mut d = Sha1::new();
        d.update(seed);
        d.update([counter]);
        result.extend_from_slice(&d.finalize());
        counter = counter.wrapping_add(1);
    }
    result.truncate(n);
    result
}
