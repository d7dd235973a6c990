//! Types and code to map circuit IDs to circuits.

use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::halfcirc::HalfCirc;
use crate::{Error, Result};
use velum_cell::chancell::CircId;

use futures::channel::{mpsc, oneshot};
use rand::Rng;
use std::collections::{hash_map::Entry, HashMap};

/// Which group of circuit IDs are we allowed to allocate in this map?
///
/// The initiator of a connection uses "high" circuit IDs (MSB set), and
/// the responder uses "low" ones; a client is always the initiator.
#[derive(Copy, Clone)]
pub(super) enum CircIdRange {
    /// Only use circuit IDs with the MSB cleared.
    #[allow(dead_code)] // relays would need this.
    Low,
    /// Only use circuit IDs with the MSB set.
    High,
}

impl CircIdRange {
    /// Return a fresh random circuit ID in the appropriate range.
    ///
    /// Ranged sampling in `rand` uses rejection, so the result is
    /// uniform: no modulo bias sneaks into our ID choices.
    fn sample<R: Rng>(self, rng: &mut R) -> CircId {
        let midpoint = 0x8000_0000_u32;
        let v = match self {
            // 0 is an invalid value
            CircIdRange::Low => rng.gen_range(1..midpoint),
            CircIdRange::High => rng.gen_range(midpoint..=u32::MAX),
        };
        CircId::new(v).expect("random circuit ID was zero")
    }
}

/// An entry in the circuit map: how to route cells that arrive for a
/// given circuit ID.
pub(super) enum CircEnt {
    /// A circuit that has not yet received a CREATED* cell.
    ///
    /// For this circuit, the CREATED* cell or DESTROY cell gets sent to
    /// the oneshot sender to tell the corresponding pending circuit that
    /// the handshake is done.
    ///
    /// Once that's done, the mpsc sender will be used to send subsequent
    /// cells to the circuit.
    Opening(
        oneshot::Sender<CreateResponse>,
        mpsc::Sender<ClientCircChanMsg>,
    ),
    /// A circuit that is open and can be given relay cells.
    Open(mpsc::Sender<ClientCircChanMsg>),
    /// A circuit where we have sent a DESTROY, but the other end might
    /// not have gotten a DESTROY yet.
    DestroySent(HalfCirc),
}

impl std::fmt::Debug for CircEnt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircEnt::Opening(_, _) => write!(f, "Opening"),
            CircEnt::Open(_) => write!(f, "Open"),
            CircEnt::DestroySent(_) => write!(f, "DestroySent"),
        }
    }
}

/// A map from circuit IDs to circuit entries.  Each channel has one.
pub(super) struct CircMap {
    /// Map from circuit IDs to entries.
    m: HashMap<CircId, CircEnt>,
    /// Rule for allocating new circuit IDs.
    range: CircIdRange,
}

impl CircMap {
    /// Make a new empty CircMap.
    pub(super) fn new(idrange: CircIdRange) -> Self {
        CircMap {
            m: HashMap::new(),
            range: idrange,
        }
    }

    /// Add a new entry (corresponding to a pending circuit) to this map.
    ///
    /// On success return the allocated circuit ID.
    pub(super) fn add_ent<R: Rng>(
        &mut self,
        rng: &mut R,
        createdsink: oneshot::Sender<CreateResponse>,
        sink: mpsc::Sender<ClientCircChanMsg>,
    ) -> Result<CircId> {
        /// How many times do we probe for a random circuit ID before we
        /// assume that the range is fully populated?
        const N_ATTEMPTS: usize = 16;
        let mut ent = Some(CircEnt::Opening(createdsink, sink));
        for _ in 0..N_ATTEMPTS {
            let id = self.range.sample(rng);
            if let Entry::Vacant(v) = self.m.entry(id) {
                v.insert(ent.take().expect("circuit entry inserted twice?"));
                return Ok(id);
            }
        }
        Err(Error::IdRangeFull)
    }

    /// Return the entry for `id` in this map, if any.
    pub(super) fn get_mut(&mut self, id: CircId) -> Option<&mut CircEnt> {
        self.m.get_mut(&id)
    }

    /// See whether `id` is an opening circuit.  If so, mark it "open"
    /// and return a oneshot::Sender that is waiting for its create cell.
    pub(super) fn advance_from_opening(
        &mut self,
        id: CircId,
    ) -> Result<oneshot::Sender<CreateResponse>> {
        let ok = matches!(self.m.get(&id), Some(CircEnt::Opening(_, _)));
        if ok {
            if let Some(CircEnt::Opening(oneshot, sink)) = self.m.remove(&id) {
                self.m.insert(id, CircEnt::Open(sink));
                Ok(oneshot)
            } else {
                Err(crate::internal!("inconsistent circuit state"))
            }
        } else {
            Err(Error::ChanProto(
                "Unexpected CREATED* cell not on opening circuit".into(),
            ))
        }
    }

    /// Called when we have sent a DESTROY on a circuit.  Configures a
    /// "HalfCirc" object to track how many cells we get on this circuit,
    /// and to prevent us from reusing it immediately.
    pub(super) fn destroy_sent(&mut self, id: CircId, hs: HalfCirc) {
        self.m.insert(id, CircEnt::DestroySent(hs));
    }

    /// Extract the value from this map with `id` if any.
    pub(super) fn remove(&mut self, id: CircId) -> Option<CircEnt> {
        self.m.remove(&id)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn circmap_basics() {
        let mut map_low = CircMap::new(CircIdRange::Low);
        let mut map_high = CircMap::new(CircIdRange::High);
        let mut ids_low: Vec<CircId> = Vec::new();
        let mut ids_high: Vec<CircId> = Vec::new();
        let mut rng = rand::thread_rng();

        assert!(map_low.get_mut(CircId::new(77).unwrap()).is_none());

        for _ in 0..128 {
            let (csnd, _) = oneshot::channel();
            let (snd, _) = mpsc::channel(8);
            let id_low = map_low.add_ent(&mut rng, csnd, snd).unwrap();
            assert!(u32::from(id_low) > 0);
            assert!(u32::from(id_low) < 0x80000000);
            assert!(!ids_low.contains(&id_low));
            ids_low.push(id_low);

            assert!(matches!(
                map_low.get_mut(id_low),
                Some(CircEnt::Opening(_, _))
            ));

            let (csnd, _) = oneshot::channel();
            let (snd, _) = mpsc::channel(8);
            let id_high = map_high.add_ent(&mut rng, csnd, snd).unwrap();
            assert!(u32::from(id_high) >= 0x80000000);
            assert!(!ids_high.contains(&id_high));
            ids_high.push(id_high);
        }

        // Test remove.
        assert!(map_low.get_mut(ids_low[0]).is_some());
        map_low.remove(ids_low[0]);
        assert!(map_low.get_mut(ids_low[0]).is_none());

        // Test advance_from_opening.
        assert!(matches!(
            map_high.get_mut(ids_high[0]),
            Some(CircEnt::Opening(_, _))
        ));
        let adv = map_high.advance_from_opening(ids_high[0]);
        assert!(adv.is_ok());
        assert!(matches!(
            map_high.get_mut(ids_high[0]),
            Some(CircEnt::Open(_))
        ));

        // Can't double-advance.
        let adv = map_high.advance_from_opening(ids_high[0]);
        assert!(adv.is_err());

        // Can't advance an entry that is not there.  We know "77" can't
        // be in map_high, since we only added high circids to it.
        let adv = map_high.advance_from_opening(CircId::new(77).unwrap());
        assert!(adv.is_err());

        // Test allocating and releasing a circuit ID leaves the ID space
        // unchanged: the same ID can be allocated again.
        let (csnd, _) = oneshot::channel();
        let (snd, _) = mpsc::channel(8);
        let mut map = CircMap::new(CircIdRange::High);
        let id = map.add_ent(&mut rng, csnd, snd).unwrap();
        map.remove(id);
        assert!(map.get_mut(id).is_none());
        assert!(map.m.is_empty());
    }
}
