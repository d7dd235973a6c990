//! The per-circuit lifecycle state machine.

use std::time::{Duration, Instant};
use tracing::warn;

/// How many consecutive stream-open timeouts we tolerate on one circuit
/// before concluding that the circuit should be dropped.
pub(crate) const STREAM_TIMEOUT_LIMIT: u32 = 3;

/// The lifecycle state of a circuit.
///
/// Legal transitions: `Unconnected → Building → Open → Destroyed`, with
/// `Unconnected`/`Building → Failed` on build failure.  `Failed` and
/// `Destroyed` are terminal.  Dirtiness is a sub-flag of `Open`, not a
/// state of its own.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    /// Created, but not yet bound to a connection or building.
    Unconnected,
    /// Build in progress: handshakes are running.
    Building,
    /// The circuit is fully built and usable.
    Open,
    /// The build failed.  Terminal.
    Failed,
    /// The circuit was torn down.  Terminal.
    Destroyed,
}

/// Status record for a single circuit: its lifecycle state plus the
/// timestamps and counters the manager's upkeep rules need.
#[derive(Debug)]
pub struct CircuitStatus {
    /// The current lifecycle state.
    state: State,
    /// When the circuit entered its current build-related state.
    ///
    /// Reset both when the build starts and when it completes, so it
    /// measures "time building" while building and "time open" after.
    created_at: Instant,
    /// When the circuit first had a stream attached, if ever.
    dirty_since: Option<Instant>,
    /// Number of consecutive stream-open timeouts.
    stream_timeouts: u32,
}

impl Default for CircuitStatus {
    fn default() -> Self {
        CircuitStatus {
            state: State::Unconnected,
            created_at: Instant::now(),
            dirty_since: None,
            stream_timeouts: 0,
        }
    }
}

impl CircuitStatus {
    /// Create a status record for a new, unconnected circuit.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return true if this circuit has not yet started building.
    pub fn is_unconnected(&self) -> bool {
        self.state == State::Unconnected
    }

    /// Return true if this circuit is currently building.
    pub fn is_building(&self) -> bool {
        self.state == State::Building
    }

    /// Return true if this circuit is fully built and not torn down.
    pub fn is_connected(&self) -> bool {
        self.state == State::Open
    }

    /// Return true if this circuit has ever carried a user stream.
    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// Return true if this circuit is destroyed or failed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self.state, State::Destroyed | State::Failed)
    }

    /// Note that this circuit has started building.
    ///
    /// Starting a build twice, or from a terminal state, is a bug.
    pub(crate) fn set_state_building(&mut self) {
        if self.state != State::Unconnected {
            debug_assert!(false, "building from {:?}", self.state);
            warn!("BUG: tried to start building a circuit in state {:?}", self.state);
            return;
        }
        self.state = State::Building;
        self.created_at = Instant::now();
    }

    /// Note that this circuit has finished building.
    pub(crate) fn set_state_open(&mut self) {
        if self.state != State::Building {
            debug_assert!(false, "open from {:?}", self.state);
            warn!("BUG: tried to open a circuit in state {:?}", self.state);
            return;
        }
        self.state = State::Open;
        self.created_at = Instant::now();
    }

    /// Note that this circuit's build has failed.  Terminal; idempotent.
    pub(crate) fn set_state_failed(&mut self) {
        match self.state {
            State::Unconnected | State::Building | State::Failed => {
                self.state = State::Failed;
            }
            State::Open | State::Destroyed => {
                debug_assert!(matches!(self.state, State::Destroyed), "failed from Open");
                // Failing a circuit that's already destroyed is a no-op.
                if self.state == State::Open {
                    warn!("BUG: tried to fail an open circuit");
                }
            }
        }
    }

    /// Note that this circuit has been torn down.  Terminal; idempotent.
    pub(crate) fn set_state_destroyed(&mut self) {
        self.state = State::Destroyed;
    }

    /// Note that a stream has been attached to this circuit.
    ///
    /// Only the first attachment matters; we track when the circuit
    /// _first_ became dirty.
    pub(crate) fn mark_dirty(&mut self) {
        if self.dirty_since.is_none() {
            self.dirty_since = Some(Instant::now());
        }
    }

    /// Count a stream-open timeout against this circuit.
    ///
    /// Returns true if the circuit has now seen enough consecutive
    /// timeouts that it should be dropped.
    pub(crate) fn count_stream_timeout(&mut self) -> bool {
        self.stream_timeouts += 1;
        self.stream_timeouts >= STREAM_TIMEOUT_LIMIT
    }

    /// Note that a stream opened successfully, resetting the
    /// consecutive-timeout counter.
    pub(crate) fn note_stream_success(&mut self) {
        self.stream_timeouts = 0;
    }

    /// Return how long this circuit has been dirty, if it is.
    pub fn time_dirty(&self) -> Option<Duration> {
        self.dirty_since.map(|t| t.elapsed())
    }

    /// Return the time since this circuit entered its current
    /// build-related state.
    pub fn time_since_creation(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Return a short name for the current state, for logs.
    pub fn state_name(&self) -> &'static str {
        match (self.state, self.dirty_since.is_some()) {
            (State::Unconnected, _) => "unconnected",
            (State::Building, _) => "building",
            (State::Open, false) => "open/clean",
            (State::Open, true) => "open/dirty",
            (State::Failed, _) => "failed",
            (State::Destroyed, _) => "destroyed",
        }
    }
}
