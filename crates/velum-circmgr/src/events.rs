//! Progress events emitted while the client is getting ready.
//!
//! These are best-effort notifications: a subscriber that lags or goes
//! away never blocks circuit or stream work.

use futures::channel::mpsc;
use std::sync::Mutex;

/// A milestone in the client's initialization.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum InitEvent {
    /// A directory circuit has been built.
    DirCircuitBuilt,
    /// A directory stream has opened and is loading.
    DirStreamOpened,
}

/// A sink for initialization-progress events, with any number of
/// subscribers.
#[derive(Debug, Default)]
pub struct InitializationTracker {
    /// The senders for all current subscribers.
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InitEvent>>>,
}

impl InitializationTracker {
    /// Create a new tracker with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InitEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().expect("poisoned lock").push(tx);
        rx
    }

    /// Report an event to every live subscriber.
    pub fn notify(&self, event: InitEvent) {
        let mut subs = self.subscribers.lock().expect("poisoned lock");
        subs.retain(|tx| tx.unbounded_send(event).is_ok());
    }
}

/// An event reported while a circuit is being built.
///
/// (This replaces the older callback-interface style of build handler:
/// same information, delivered as values on a channel.)
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum CircuitEvent {
    /// A hop finished its handshake and was added to the circuit.
    HopAdded(String),
    /// The whole circuit finished building.
    Built,
    /// The build failed, with a human-readable reason.
    Failed(String),
}

/// A best-effort sender for [`CircuitEvent`]s.
pub type CircuitEventSink = Option<mpsc::UnboundedSender<CircuitEvent>>;

/// Send `event` on `sink`, if there is a sink and it is still open.
pub(crate) fn emit(sink: &CircuitEventSink, event: CircuitEvent) {
    if let Some(tx) = sink {
        let _ = tx.unbounded_send(event);
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn events_fan_out() {
        let tracker = InitializationTracker::new();
        let mut rx1 = tracker.subscribe();
        let mut rx2 = tracker.subscribe();
        tracker.notify(InitEvent::DirCircuitBuilt);
        tracker.notify(InitEvent::DirStreamOpened);
        drop(rx2);
        // A dropped subscriber doesn't stop the rest.
        tracker.notify(InitEvent::DirStreamOpened);
        assert_eq!(rx1.try_next().unwrap(), Some(InitEvent::DirCircuitBuilt));
        assert_eq!(rx1.try_next().unwrap(), Some(InitEvent::DirStreamOpened));
        assert_eq!(rx1.try_next().unwrap(), Some(InitEvent::DirStreamOpened));
    }
}
