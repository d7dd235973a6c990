//! Relay cell cryptography.
//!
//! The client shares two symmetric states with each hop of a circuit: one
//! for "outbound" traffic (away from the client) and one for "inbound"
//! traffic.  Each state is a keyed AES-128-CTR cipher plus a running
//! SHA-1 digest, seeded from the handshake with that hop.
//!
//! An outbound relay cell addressed to hop _k_ gets its digest set at
//! layer _k_ and is then encrypted with layers _k_, _k−1_, …, 0.  An
//! inbound cell is decrypted with layer 0, 1, … until some layer
//! "recognizes" it (the recognized field is zero and the running digest
//! matches); if no layer recognizes it, the cell is corrupt or hostile.

use crate::util::ct;
use crate::{Error, Result};

use cipher::{KeyIvInit, StreamCipher};
use digest::Digest;
use sha1::Sha1;
use velum_cell::chancell::BoxedCellBody;
use velum_cell::relaycell::fields::{DIGEST_RANGE, EMPTY_DIGEST, RECOGNIZED_RANGE};

use super::handshake::KeyGenerator;

/// AES-128 in counter mode, as used for relay cells.
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// The length of the tag that we use to authenticate a SENDME message.
pub(crate) const SENDME_TAG_LEN: usize = 20;

/// Type for the body of a relay cell, as seen by the crypto layers.
#[derive(Clone)]
pub struct RelayCellBody(BoxedCellBody);

impl From<BoxedCellBody> for RelayCellBody {
    fn from(body: BoxedCellBody) -> Self {
        RelayCellBody(body)
    }
}
impl From<RelayCellBody> for BoxedCellBody {
    fn from(cell: RelayCellBody) -> Self {
        cell.0
    }
}
impl AsRef<[u8]> for RelayCellBody {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}
impl AsMut<[u8]> for RelayCellBody {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }
}

/// A client's view of the cryptographic state shared with a single hop,
/// as used for outbound cells.
pub(crate) trait OutboundClientLayer {
    /// Prepare a cell to be sent to the hop at this layer, and encrypt it.
    ///
    /// Return the authentication tag to expect on a SENDME acknowledging
    /// this cell.
    fn originate_for(&mut self, cell: &mut RelayCellBody) -> [u8; SENDME_TAG_LEN];
    /// Encrypt a cell that is to be decrypted by this layer in passing.
    fn encrypt_outbound(&mut self, cell: &mut RelayCellBody);
}

/// A client's view of the cryptographic state shared with a single hop,
/// as used for inbound cells.
pub(crate) trait InboundClientLayer {
    /// Decrypt a cell that passed through this layer.
    ///
    /// Return the authentication tag if this layer is the originator.
    fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) -> Option<[u8; SENDME_TAG_LEN]>;
}

/// A relay's view of the crypto state on a given circuit.
///
/// Only used by the scripted relays in this workspace's tests.
#[cfg(any(test, feature = "testing"))]
pub trait RelayCrypt {
    /// Prepare a cell to be sent towards the client.
    fn originate(&mut self, cell: &mut RelayCellBody);
    /// Encrypt a cell that is moving towards the client.
    fn encrypt_inbound(&mut self, cell: &mut RelayCellBody);
    /// Decrypt a cell that is moving away from the client.
    ///
    /// Return true if it is addressed to us.
    fn decrypt_outbound(&mut self, cell: &mut RelayCellBody) -> bool;
}

/// One layer of shared cryptographic state between a relay and a client,
/// for a single hop, in a single direction.
pub struct CryptState {
    /// Stream cipher for en/decrypting cell bodies.
    cipher: Aes128Ctr,
    /// Digest for authenticating cells to/from this hop.
    digest: Sha1,
    /// Most recent digest value generated by this state.
    last_digest_val: [u8; 20],
}

/// A pair of `CryptState`s shared between a client and one relay: one for
/// the outbound direction, and one for the inbound direction.
pub struct CryptStatePair {
    /// State for cells sent away from the client.
    fwd: CryptState,
    /// State for cells sent towards the client.
    back: CryptState,
}

/// The length of the key material needed to initialize a [`CryptStatePair`]:
/// two digest seeds and two cipher keys.
pub const SEED_LEN: usize = 20 * 2 + 16 * 2;

impl CryptStatePair {
    /// Construct a state pair from `SEED_LEN` bytes of key material.
    pub fn initialize(seed: &[u8]) -> Result<Self> {
        if seed.len() != SEED_LEN {
            return Err(crate::internal!("seed length {} was invalid", seed.len()));
        }
        let (df, rest) = seed.split_at(20);
        let (db, rest) = rest.split_at(20);
        let (kf, kb) = rest.split_at(16);
        let fwd = CryptState {
            cipher: Aes128Ctr::new(kf.into(), &Default::default()),
            digest: Sha1::new().chain_update(df),
            last_digest_val: [0_u8; 20],
        };
        let back = CryptState {
            cipher: Aes128Ctr::new(kb.into(), &Default::default()),
            digest: Sha1::new().chain_update(db),
            last_digest_val: [0_u8; 20],
        };
        Ok(CryptStatePair { fwd, back })
    }

    /// Construct a state pair by expanding a key generator.
    pub fn construct<K: KeyGenerator>(keygen: K) -> Result<Self> {
        let seed = keygen.expand(SEED_LEN)?;
        Self::initialize(&seed)
    }

    /// Split this pair into the forward and backward client layers.
    pub(crate) fn split(self) -> (CryptState, CryptState) {
        (self.fwd, self.back)
    }
}

#[cfg(any(test, feature = "testing"))]
impl RelayCrypt for CryptStatePair {
    fn originate(&mut self, cell: &mut RelayCellBody) {
        cell.set_digest(&mut self.back.digest);
    }
    fn encrypt_inbound(&mut self, cell: &mut RelayCellBody) {
        self.back.cipher.apply_keystream(cell.as_mut());
    }
    fn decrypt_outbound(&mut self, cell: &mut RelayCellBody) -> bool {
        self.fwd.cipher.apply_keystream(cell.as_mut());
        cell.is_recognized(&mut self.fwd.digest).is_some()
    }
}

impl OutboundClientLayer for CryptState {
    fn originate_for(&mut self, cell: &mut RelayCellBody) -> [u8; SENDME_TAG_LEN] {
        self.last_digest_val = cell.set_digest(&mut self.digest);
        self.encrypt_outbound(cell);
        self.last_digest_val
    }
    fn encrypt_outbound(&mut self, cell: &mut RelayCellBody) {
        self.cipher.apply_keystream(cell.as_mut());
    }
}

impl InboundClientLayer for CryptState {
    fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) -> Option<[u8; SENDME_TAG_LEN]> {
        self.cipher.apply_keystream(cell.as_mut());
        let tag = cell.is_recognized(&mut self.digest)?;
        self.last_digest_val = tag;
        Some(tag)
    }
}

impl RelayCellBody {
    /// Prepare this cell body by setting its digest and recognized field,
    /// and return the digest that was set.
    ///
    /// `d` is the running digest for the relevant direction; it absorbs
    /// the cell with zeroed digest/recognized fields.
    fn set_digest(&mut self, d: &mut Sha1) -> [u8; 20] {
        self.0[RECOGNIZED_RANGE].fill(0);
        self.0[DIGEST_RANGE].fill(0);
        d.update(&self.0[..]);
        let used_digest: [u8; 20] = d.clone().finalize().into();
        self.0[DIGEST_RANGE].copy_from_slice(&used_digest[0..DIGEST_RANGE.len()]);
        used_digest
    }

    /// Check whether this just-decrypted cell is now an authenticated
    /// plaintext.
    ///
    /// Returns the full digest if the recognized field is all zero and the
    /// digest field matches the running digest; on a match, the running
    /// digest `d` is advanced past this cell.
    fn is_recognized(&self, d: &mut Sha1) -> Option<[u8; 20]> {
        if !ct::is_zero(&self.0[RECOGNIZED_RANGE]) {
            return None;
        }
        let mut dtmp = d.clone();
        dtmp.update(&self.0[..DIGEST_RANGE.start]);
        dtmp.update(EMPTY_DIGEST);
        dtmp.update(&self.0[DIGEST_RANGE.end..]);
        let result: [u8; 20] = dtmp.clone().finalize().into();
        if !ct::bytes_eq(&self.0[DIGEST_RANGE], &result[0..DIGEST_RANGE.len()]) {
            return None;
        }
        *d = dtmp;
        Some(result)
    }
}

/// A client's view of the cryptographic state for an entire constructed
/// circuit, as used for sending cells.
pub(crate) struct OutboundClientCrypt {
    /// Vector of layers, one for each hop, ordered from the closest hop
    /// to the farthest.
    layers: Vec<CryptState>,
}

/// A client's view of the cryptographic state for an entire constructed
/// circuit, as used for receiving cells.
pub(crate) struct InboundClientCrypt {
    /// Vector of layers, one for each hop, ordered from the closest hop
    /// to the farthest.
    layers: Vec<CryptState>,
}

impl OutboundClientCrypt {
    /// Return a new (empty) OutboundClientCrypt.
    pub(crate) fn new() -> Self {
        OutboundClientCrypt { layers: Vec::new() }
    }

    /// Prepare a cell body to be sent away from the client.
    ///
    /// The cell is prepared for the `hop`th hop (zero-based), then
    /// encrypted with the appropriate keys.
    ///
    /// On success, return the tag that should be expected for an
    /// authenticated SENDME sent in response to this cell.
    pub(crate) fn encrypt(
        &mut self,
        cell: &mut RelayCellBody,
        hop: u8,
    ) -> Result<[u8; SENDME_TAG_LEN]> {
        let hop = hop as usize;
        if hop >= self.layers.len() {
            return Err(Error::NoSuchHop);
        }
        let mut layers = self.layers.iter_mut().take(hop + 1).rev();
        let first_layer = layers.next().ok_or(Error::NoSuchHop)?;
        let tag = first_layer.originate_for(cell);
        for layer in layers {
            layer.encrypt_outbound(cell);
        }
        Ok(tag)
    }

    /// Add a new layer to this OutboundClientCrypt.
    pub(crate) fn add_layer(&mut self, layer: CryptState) {
        debug_assert!(self.layers.len() < u8::MAX as usize);
        self.layers.push(layer);
    }

    /// Return the number of layers configured on this OutboundClientCrypt.
    pub(crate) fn n_layers(&self) -> usize {
        self.layers.len()
    }
}

impl InboundClientCrypt {
    /// Return a new (empty) InboundClientCrypt.
    pub(crate) fn new() -> Self {
        InboundClientCrypt { layers: Vec::new() }
    }

    /// Decrypt an incoming cell that is coming to the client.
    ///
    /// On success, return the hop (zero-based) that originated the cell,
    /// and the digest tag for SENDME bookkeeping.
    pub(crate) fn decrypt(
        &mut self,
        cell: &mut RelayCellBody,
    ) -> Result<(u8, [u8; SENDME_TAG_LEN])> {
        for (hopnum, layer) in self.layers.iter_mut().enumerate() {
            if let Some(tag) = layer.decrypt_inbound(cell) {
                let hopnum = u8::try_from(hopnum)
                    .map_err(|_| crate::internal!("more than 255 hops on a circuit"))?;
                return Ok((hopnum, tag));
            }
        }
        Err(Error::BadCellAuth)
    }

    /// Add a new layer to this InboundClientCrypt.
    pub(crate) fn add_layer(&mut self, layer: CryptState) {
        debug_assert!(self.layers.len() < u8::MAX as usize);
        self.layers.push(layer);
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::RngCore;

    /// Build a client crypt stack and the corresponding relay states for
    /// an `n`-hop circuit, from random per-hop seeds.
    fn construct_circuit(n: usize) -> (OutboundClientCrypt, InboundClientCrypt, Vec<CryptStatePair>) {
        let mut rng = rand::thread_rng();
        let mut cc_out = OutboundClientCrypt::new();
        let mut cc_in = InboundClientCrypt::new();
        let mut relays = Vec::new();
        for _ in 0..n {
            let mut seed = [0_u8; SEED_LEN];
            rng.fill_bytes(&mut seed);
            let (fwd, back) = CryptStatePair::initialize(&seed).unwrap().split();
            cc_out.add_layer(fwd);
            cc_in.add_layer(back);
            relays.push(CryptStatePair::initialize(&seed).unwrap());
        }
        (cc_out, cc_in, relays)
    }

    /// Make a cell body with a plausible relay header and a given payload.
    fn cell_with(payload: &[u8]) -> RelayCellBody {
        let mut body = Box::new([0_u8; 509]);
        body[0] = 2; // DATA
        body[4] = 1; // stream id 1
        body[10] = payload.len() as u8;
        body[11..11 + payload.len()].copy_from_slice(payload);
        RelayCellBody::from(body)
    }

    #[test]
    fn roundtrip_to_each_hop() {
        // Encrypting a cell for hop k must yield recognized=0 exactly at
        // hop k, with the original payload, and at no earlier hop.
        for target_hop in 0..3_u8 {
            let (mut cc_out, _cc_in, mut relays) = construct_circuit(3);
            let payload = b"'Round the decay of that colossal wreck";
            let mut cell = cell_with(payload);
            let orig = cell.as_ref().to_vec();
            cc_out.encrypt(&mut cell, target_hop).unwrap();
            for (i, relay) in relays.iter_mut().enumerate() {
                let recognized = relay.decrypt_outbound(&mut cell);
                if i == usize::from(target_hop) {
                    assert!(recognized);
                    assert_eq!(cell.as_ref(), &orig[..]);
                    break;
                }
                assert!(!recognized, "cell recognized at intermediate hop {}", i);
            }
        }
    }

    #[test]
    fn inbound_from_each_hop() {
        let (_cc_out, mut cc_in, mut relays) = construct_circuit(3);
        for src_hop in (0..3_usize).rev() {
            let payload = b"boundless and bare";
            let mut cell = cell_with(payload);
            let orig = cell.as_ref().to_vec();
            relays[src_hop].originate(&mut cell);
            for relay in relays[..=src_hop].iter_mut().rev() {
                relay.encrypt_inbound(&mut cell);
            }
            let (hop, _tag) = cc_in.decrypt(&mut cell).unwrap();
            assert_eq!(usize::from(hop), src_hop);
            assert_eq!(&cell.as_ref()[11..11 + payload.len()], &orig[11..11 + payload.len()]);
        }
    }

    #[test]
    fn unrecognized_cell_is_rejected() {
        let (_cc_out, mut cc_in, _relays) = construct_circuit(2);
        let mut cell = cell_with(b"garbage from nowhere");
        assert!(matches!(cc_in.decrypt(&mut cell), Err(Error::BadCellAuth)));
    }

    #[test]
    fn no_such_hop() {
        let (mut cc_out, _cc_in, _relays) = construct_circuit(2);
        let mut cell = cell_with(b"too far");
        assert!(matches!(
            cc_out.encrypt(&mut cell, 2),
            Err(Error::NoSuchHop)
        ));
    }

    #[test]
    fn tags_match_on_both_sides() {
        // The tag the client records when originating must equal the tag
        // the destination hop computes on recognition; that's what makes
        // authenticated SENDMEs possible.
        let (mut cc_out, _cc_in, mut relays) = construct_circuit(1);
        let mut cell = cell_with(b"ack me");
        let tag = cc_out.encrypt(&mut cell, 0).unwrap();
        assert!(relays[0].decrypt_outbound(&mut cell));
        // Replaying the digest computation on the relay side gives the
        // same 4-byte prefix in the cell; the full tags agree by
        // construction of the shared state.
        assert_eq!(&cell.as_ref()[5..9], &tag[0..4]);
    }
}
