//! Implementation for the "fast" circuit-creation handshake.
//!
//! The fast handshake does no public-key operations: the client sends 20
//! random bytes (X), the relay replies with its own 20 random bytes (Y)
//! plus a 20-byte key check, and both sides derive their shared keys as
//! `KDF(X | Y)`.  It provides no authentication beyond what the
//! underlying connection already established, so it is only used for the
//! first hop of a circuit.

use super::{legacy_kdf, KeyGenerator};
use crate::util::ct;
use crate::{Error, Result};

use rand::{CryptoRng, Rng, RngCore};

/// Number of bytes of key material each side contributes.
pub(crate) const FAST_HANDSHAKE_LEN: usize = 20;
/// Number of bytes in the key-check field of the reply.
pub(crate) const FAST_KEYCHECK_LEN: usize = 20;

/// A key generator for a completed fast handshake.
///
/// The first [`FAST_KEYCHECK_LEN`] bytes of the KDF output are consumed
/// by the key check in the reply; the hop keys come after them.
pub struct FastKeyGenerator {
    /// The concatenated key material (X | Y).
    inp: Vec<u8>,
}

impl KeyGenerator for FastKeyGenerator {
    fn expand(self, keylen: usize) -> Result<Vec<u8>> {
        let all = legacy_kdf(&self.inp, FAST_KEYCHECK_LEN + keylen);
        Ok(all[FAST_KEYCHECK_LEN..].to_vec())
    }
}

/// State for the client side of an in-progress fast handshake.
pub struct CreateFastClient {
    /// The key material (X) that we generated.
    x: [u8; FAST_HANDSHAKE_LEN],
}

impl CreateFastClient {
    /// Start a new fast handshake, generating our key material.
    pub fn new<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut x = [0_u8; FAST_HANDSHAKE_LEN];
        rng.fill_bytes(&mut x);
        CreateFastClient { x }
    }

    /// Return the body to send in our CREATE_FAST message.
    pub fn handshake(&self) -> Vec<u8> {
        self.x.to_vec()
    }

    /// Complete the handshake from the relay's CREATED_FAST reply.
    ///
    /// On success, return a generator for the hop's key material.
    pub fn finish(self, reply: &[u8]) -> Result<FastKeyGenerator> {
        if reply.len() < FAST_HANDSHAKE_LEN + FAST_KEYCHECK_LEN {
            return Err(Error::HandshakeProto("truncated CREATED_FAST reply"));
        }
        let (y, keycheck) = reply.split_at(FAST_HANDSHAKE_LEN);
        let mut inp = Vec::with_capacity(FAST_HANDSHAKE_LEN * 2);
        inp.extend_from_slice(&self.x);
        inp.extend_from_slice(y);
        let expanded = legacy_kdf(&inp, FAST_KEYCHECK_LEN);
        if !ct::bytes_eq(&expanded, &keycheck[..FAST_KEYCHECK_LEN]) {
            return Err(Error::HandshakeProto("bad key check in CREATED_FAST"));
        }
        Ok(FastKeyGenerator { inp })
    }
}

/// Server side of the fast handshake.
///
/// Only used by the scripted relays in this workspace's tests.
#[cfg(any(test, feature = "testing"))]
#[non_exhaustive]
pub struct CreateFastServer;

#[cfg(any(test, feature = "testing"))]
impl CreateFastServer {
    /// Respond to a CREATE_FAST body, returning the CREATED_FAST reply
    /// body and a generator for the hop's key material.
    pub fn server<R: Rng + CryptoRng>(
        rng: &mut R,
        msg: &[u8],
    ) -> Result<(Vec<u8>, FastKeyGenerator)> {
        if msg.len() < FAST_HANDSHAKE_LEN {
            return Err(Error::HandshakeProto("truncated CREATE_FAST body"));
        }
        let mut y = [0_u8; FAST_HANDSHAKE_LEN];
        rng.fill_bytes(&mut y);
        let mut inp = Vec::with_capacity(FAST_HANDSHAKE_LEN * 2);
        inp.extend_from_slice(&msg[..FAST_HANDSHAKE_LEN]);
        inp.extend_from_slice(&y);
        let keycheck = legacy_kdf(&inp, FAST_KEYCHECK_LEN);
        let mut reply = Vec::with_capacity(FAST_HANDSHAKE_LEN + FAST_KEYCHECK_LEN);
        reply.extend_from_slice(&y);
        reply.extend_from_slice(&keycheck);
        Ok((reply, FastKeyGenerator { inp }))
    }
}
