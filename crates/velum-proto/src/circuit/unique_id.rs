//! Process-unique identifiers for circuits, for use in logs.

use std::fmt::{Display, Formatter};

/// Process-unique identifier for a circuit.
///
/// We could use channel and circuit IDs here, but those can be reused
/// over time.  This identifier is guaranteed to be unique for the
/// lifetime of the process, so it is the one we log.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UniqId {
    /// Channel that this circuit is on.
    chan: usize,
    /// ID for the circuit on the channel.
    circ: usize,
}

impl UniqId {
    /// Construct a new circuit UniqId from its parts.
    pub(crate) fn new(chan: usize, circ: usize) -> Self {
        UniqId { chan, circ }
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circ {}.{}", self.chan, self.circ)
    }
}
