//! Type for tracking half-closed circuits.

use crate::{Error, Result};

/// A circuit that we've sent a DESTROY for, but where the other side
/// might not have seen it yet.
///
/// We need to track these, since otherwise we'd be willing to reuse the
/// circuit ID while the other side still thinks it's in use, and a
/// window of cells from the old circuit may still be in flight.
#[derive(Debug)]
pub(crate) struct HalfCirc {
    /// How many RELAY cells are we still willing to accept on this
    /// circuit before we conclude the other side is simply ignoring our
    /// DESTROY?
    allow_relay_cells: u16,
}

impl HalfCirc {
    /// Create a new HalfCirc that will allow `total_windows` more relay
    /// cells.
    pub(crate) fn new(total_windows: u16) -> Self {
        HalfCirc {
            allow_relay_cells: total_windows,
        }
    }

    /// Try to receive a relay cell on this circuit.  Give an error if
    /// there are too many.
    pub(crate) fn receive_cell(&mut self) -> Result<()> {
        if let Some(n) = self.allow_relay_cells.checked_sub(1) {
            self.allow_relay_cells = n;
            Ok(())
        } else {
            Err(Error::ChanProto(
                "Too many cells received on destroyed circuit".into(),
            ))
        }
    }
}
