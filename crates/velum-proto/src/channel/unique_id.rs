//! Counter for allocating process-unique channel identifiers.
//!
//! We don't use these identifiers for anything besides logging.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counter for allocating unique-ish identifiers for channels.
static CHANNEL_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identifier for a channel.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UniqId(usize);

impl UniqId {
    /// Construct a new UniqId.
    pub(crate) fn new() -> Self {
        // Relaxed ordering is fine; we don't care about how this
        // is instantiated with respect to other channels.
        let id = CHANNEL_COUNT.fetch_add(1, Ordering::Relaxed);
        UniqId(id)
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chan {}", self.0)
    }
}

/// Counter for allocating circuit unique IDs within a channel.
pub(crate) struct CircUniqIdContext {
    /// Next value to be handed out for this channel's circuits.
    next_circ_id: usize,
}

impl CircUniqIdContext {
    /// Create a new CircUniqIdContext.
    pub(super) fn new() -> Self {
        CircUniqIdContext { next_circ_id: 0 }
    }

    /// Construct a new, unique-ish circuit UniqId.
    pub(super) fn next(&mut self, unique_id: UniqId) -> crate::circuit::UniqId {
        let circ_unique_id = self.next_circ_id;
        self.next_circ_id += 1;
        crate::circuit::UniqId::new(unique_id.0, circ_unique_id)
    }
}
