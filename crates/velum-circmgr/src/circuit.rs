//! A managed circuit: the manager's view of one circuit, combining the
//! protocol-level circuit with its lifecycle status, its hop records,
//! and its failed-exit memo.

use crate::directory::Relay;
use crate::events::{self, CircuitEvent, CircuitEventSink};
use crate::requests::OpenStreamResponse;
use crate::status::CircuitStatus;
use crate::usage::ExitTarget;
use crate::{CircMgrInner, Error, Result};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};
use velum_proto::circuit::ClientCirc;
use velum_proto::stream::DataStream;

/// A circuit, as managed by the circuit manager.
///
/// A `Circuit` is created unconnected; [`Circuit::open_circuit`] builds
/// it along a chosen path.  Once open, streams can be attached to it
/// until it is destroyed (by local policy, or by the network).
pub struct Circuit {
    /// The manager that owns this circuit's registry entries.
    mgr: Weak<CircMgrInner>,
    /// True if this circuit is for directory access only.
    is_directory: bool,
    /// The lifecycle state of this circuit.
    status: Mutex<CircuitStatus>,
    /// The relays on this circuit, in order.  Append-only until the
    /// circuit is destroyed.
    hops: Mutex<Vec<Relay>>,
    /// The protocol-level circuit, once the build has bound us to a
    /// connection.
    circ: Mutex<Option<ClientCirc>>,
    /// Exit targets that this circuit has already failed on.  Consulted
    /// before reusing the circuit for the same target.
    failed_exits: Mutex<HashSet<ExitTarget>>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status.lock().expect("poisoned lock");
        let hops: Vec<String> = self
            .hops
            .lock()
            .expect("poisoned lock")
            .iter()
            .map(|r| r.nickname().to_string())
            .collect();
        f.debug_struct("Circuit")
            .field("state", &status.state_name())
            .field("path", &hops)
            .finish_non_exhaustive()
    }
}

impl Circuit {
    /// Create a new unconnected circuit, owned by `mgr`.
    pub(crate) fn new(mgr: Weak<CircMgrInner>, is_directory: bool) -> Arc<Self> {
        Arc::new(Circuit {
            mgr,
            is_directory,
            status: Mutex::new(CircuitStatus::new()),
            hops: Mutex::new(Vec::new()),
            circ: Mutex::new(None),
            failed_exits: Mutex::new(HashSet::new()),
        })
    }

    /// Return the manager that owns this circuit, or an error if it has
    /// shut down.
    fn mgr(&self) -> Result<Arc<CircMgrInner>> {
        self.mgr.upgrade().ok_or(Error::ManagerClosed)
    }

    /// Return true if this circuit was created for directory access.
    pub fn is_directory_circuit(&self) -> bool {
        self.is_directory
    }

    /// Return true if this circuit is fully built and usable.
    pub fn is_connected(&self) -> bool {
        self.status.lock().expect("poisoned lock").is_connected()
    }

    /// Return true if this circuit is currently building.
    pub fn is_pending(&self) -> bool {
        self.status.lock().expect("poisoned lock").is_building()
    }

    /// Return true if this circuit is open and has never carried a user
    /// stream.
    pub fn is_clean(&self) -> bool {
        let status = self.status.lock().expect("poisoned lock");
        status.is_connected() && !status.is_dirty()
    }

    /// Return how long this circuit has been dirty, if it is.
    pub fn time_dirty(&self) -> Option<Duration> {
        self.status.lock().expect("poisoned lock").time_dirty()
    }

    /// Return the relays on this circuit, first hop first.
    pub fn path(&self) -> Vec<Relay> {
        self.hops.lock().expect("poisoned lock").clone()
    }

    /// Return the final relay on this circuit, if it has one yet.
    pub fn last_relay(&self) -> Option<Relay> {
        self.hops.lock().expect("poisoned lock").last().cloned()
    }

    /// Remember that this circuit failed to reach `target`, so that
    /// retries pick a different circuit.
    pub fn record_failed_exit_target(&self, target: &ExitTarget) {
        self.failed_exits
            .lock()
            .expect("poisoned lock")
            .insert(target.clone());
    }

    /// Return true if this circuit's exit admits `target`, and the
    /// circuit hasn't already failed on it.
    pub fn can_handle_exit_to(&self, target: &ExitTarget) -> bool {
        if self
            .failed_exits
            .lock()
            .expect("poisoned lock")
            .contains(target)
        {
            return false;
        }
        let Some(last) = self.last_relay() else {
            return false;
        };
        match target.address() {
            Some(addr) => last.policy().allows_target(Some(addr), target.port()),
            None => last.policy().allows_target(None, target.port()),
        }
    }

    /// Return true if this circuit's exit admits `port` for at least
    /// some address.
    pub fn can_handle_exit_to_port(&self, port: u16) -> bool {
        self.last_relay()
            .map(|r| r.policy().allows_port(port))
            .unwrap_or(false)
    }

    /// Return the protocol-level circuit, or an error if we aren't
    /// connected.
    fn client_circ(&self) -> Result<ClientCirc> {
        self.circ
            .lock()
            .expect("poisoned lock")
            .clone()
            .ok_or(Error::UnusableCircuit("circuit is not connected"))
    }

    /// Synchronously drive a build of this circuit along `path`.
    ///
    /// Progress is reported on `events` as each hop completes, then once
    /// for overall completion or failure.  On failure the circuit is
    /// left in a terminal state and removed from the registries.
    pub async fn open_circuit(
        self: &Arc<Self>,
        path: Vec<Relay>,
        events: CircuitEventSink,
    ) -> Result<()> {
        let mgr = self.mgr()?;
        {
            let mut status = self.status.lock().expect("poisoned lock");
            if !status.is_unconnected() {
                return Err(Error::UnusableCircuit("can only connect unconnected circuits"));
            }
            status.set_state_building();
        }
        mgr.circuit_start_connect(self);

        match self.open_circuit_inner(&mgr, &path, &events).await {
            Ok(()) => {
                self.status
                    .lock()
                    .expect("poisoned lock")
                    .set_state_open();
                mgr.circuit_connected(self);
                events::emit(&events, CircuitEvent::Built);
                info!("Built circuit {:?}", self);
                Ok(())
            }
            Err(e) => {
                debug!("Circuit build failed: {}", e);
                self.status
                    .lock()
                    .expect("poisoned lock")
                    .set_state_failed();
                mgr.circuit_inactive(self);
                events::emit(&events, CircuitEvent::Failed(e.to_string()));
                if let Some(c) = self.circ.lock().expect("poisoned lock").take() {
                    c.terminate();
                }
                Err(e)
            }
        }
    }

    /// Helper for `open_circuit`: acquire a connection and run the
    /// handshakes, appending hop records as hops complete.
    async fn open_circuit_inner(
        self: &Arc<Self>,
        mgr: &Arc<CircMgrInner>,
        path: &[Relay],
        events: &CircuitEventSink,
    ) -> Result<()> {
        let first = path
            .first()
            .ok_or_else(|| Error::NoPath("can't build a circuit with no hops".into()))?;
        let channel = mgr.channels().get_or_launch(first).await?;

        let (pending, reactor) = channel.new_circ().await?;
        // The reactor task also watches for the circuit going away, so
        // that a DESTROY from the network updates the registries.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = reactor.run().await;
            if let Some(circuit) = weak.upgrade() {
                circuit.note_closed();
            }
        });

        let circ = pending.create_firsthop_fast().await?;
        *self.circ.lock().expect("poisoned lock") = Some(circ.clone());
        self.hops.lock().expect("poisoned lock").push(first.clone());
        events::emit(events, CircuitEvent::HopAdded(first.nickname().to_string()));

        for relay in &path[1..] {
            circ.extend(relay.nickname(), relay.linkspecs()).await?;
            self.hops.lock().expect("poisoned lock").push(relay.clone());
            events::emit(events, CircuitEvent::HopAdded(relay.nickname().to_string()));
        }
        Ok(())
    }

    /// Open an exit stream to `target` on this circuit.
    ///
    /// A response (rather than an error) is returned whenever the
    /// circuit stays usable: the remote refusing or ignoring the
    /// request is something the caller can retry elsewhere.
    pub async fn open_exit_stream(&self, target: &ExitTarget) -> Result<OpenStreamResponse> {
        let mgr = self.mgr()?;
        let circ = self.client_circ()?;
        self.mark_dirty(&mgr);

        let stream_timeout = mgr.config().circuit_timing.stream_timeout;
        let addr_string = target.addr_string();
        let attempt = circ.begin_stream(&addr_string, target.port());
        self.finish_stream_open(&mgr, timeout(stream_timeout, attempt).await)
    }

    /// Open a directory stream on this circuit.
    pub async fn open_directory_stream(&self) -> Result<OpenStreamResponse> {
        let mgr = self.mgr()?;
        let circ = self.client_circ()?;
        self.mark_dirty(&mgr);

        let stream_timeout = mgr.config().circuit_timing.stream_timeout;
        let attempt = async {
            let mut stream = circ.begin_dir_stream().await?;
            stream.wait_for_connection().await?;
            Ok(stream)
        };
        self.finish_stream_open(&mgr, timeout(stream_timeout, attempt).await)
    }

    /// Classify the outcome of a stream-open attempt, doing the timeout
    /// accounting.
    fn finish_stream_open(
        &self,
        _mgr: &Arc<CircMgrInner>,
        outcome: std::result::Result<velum_proto::Result<DataStream>, tokio::time::error::Elapsed>,
    ) -> Result<OpenStreamResponse> {
        match outcome {
            Ok(Ok(stream)) => {
                self.status
                    .lock()
                    .expect("poisoned lock")
                    .note_stream_success();
                Ok(OpenStreamResponse::Opened(stream))
            }
            Ok(Err(velum_proto::Error::EndReceived { reason })) => {
                info!("Error opening stream on {:?}: {}", self, reason.human_str());
                Ok(OpenStreamResponse::Error {
                    reason,
                    msg: reason.human_str().to_string(),
                })
            }
            Ok(Err(e)) => Err(Error::Protocol(e)),
            Err(_elapsed) => {
                info!("Timeout opening stream on {:?}", self);
                let drop_circuit = self
                    .status
                    .lock()
                    .expect("poisoned lock")
                    .count_stream_timeout();
                if drop_circuit {
                    warn!("Too many stream timeouts; dropping circuit {:?}", self);
                    self.destroy_circuit();
                }
                Ok(OpenStreamResponse::Timeout)
            }
        }
    }

    /// Note a stream attachment: the first one moves this circuit from
    /// clean to dirty.
    ///
    /// Going dirty is one of the matcher's retry triggers: the pool of
    /// clean circuits just shrank, so pending requests get another
    /// matching pass right away instead of waiting for the next tick.
    /// (The pass runs on its own task, since this may be called from
    /// inside the matcher itself.)
    fn mark_dirty(&self, mgr: &Arc<CircMgrInner>) {
        let newly_dirty = {
            let mut status = self.status.lock().expect("poisoned lock");
            let was_dirty = status.is_dirty();
            status.mark_dirty();
            !was_dirty
        };
        if newly_dirty {
            mgr.circuit_dirty(self);
            let mgr = Arc::clone(mgr);
            tokio::spawn(async move {
                mgr.attach_pending_requests().await;
            });
        }
    }

    /// Tear this circuit down: destroy the protocol-level circuit and
    /// drop it from every registry.
    pub fn destroy_circuit(&self) {
        self.status
            .lock()
            .expect("poisoned lock")
            .set_state_destroyed();
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.circuit_inactive(self);
        }
        let circ = self.circ.lock().expect("poisoned lock").clone();
        if let Some(c) = circ {
            c.terminate();
        }
    }

    /// Called when the protocol-level circuit's reactor has exited:
    /// whatever the cause, this circuit is over.
    pub(crate) fn note_closed(&self) {
        {
            let mut status = self.status.lock().expect("poisoned lock");
            if status.is_destroyed() {
                return;
            }
            if status.is_building() || status.is_unconnected() {
                status.set_state_failed();
            } else {
                status.set_state_destroyed();
            }
        }
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.circuit_inactive(self);
        }
    }

    /// Give up on a build that has exceeded its deadline.
    pub(crate) fn abandon_build(&self, why: &str) {
        debug!("Abandoning circuit build: {}", why);
        {
            let mut status = self.status.lock().expect("poisoned lock");
            if !status.is_building() {
                return;
            }
            status.set_state_failed();
        }
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.circuit_inactive(self);
        }
        let circ = self.circ.lock().expect("poisoned lock").take();
        if let Some(c) = circ {
            c.terminate();
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::usage::ExitPolicy;

    #[test]
    fn exit_memo_and_policy() {
        let circ = Circuit::new(std::sync::Weak::new(), false);
        let target = ExitTarget::from_hostname("example.com", 80);
        // No hops yet: nothing is reachable.
        assert!(!circ.can_handle_exit_to(&target));

        circ.hops.lock().expect("poisoned lock").push(Relay::new(
            "exit",
            [9; 20],
            "192.0.2.9:9001",
            0,
            ExitPolicy::accept_ports(&[80]),
        ));
        assert!(circ.can_handle_exit_to(&target));
        assert!(circ.can_handle_exit_to_port(80));
        assert!(!circ.can_handle_exit_to_port(443));

        // A recorded failure excludes the target, but not the port or
        // other targets.
        circ.record_failed_exit_target(&target);
        assert!(!circ.can_handle_exit_to(&target));
        assert!(circ.can_handle_exit_to(&ExitTarget::from_hostname("other.example", 80)));
        assert!(circ.can_handle_exit_to_port(80));
    }

    #[test]
    fn address_targets_use_address_rules() {
        let circ = Circuit::new(std::sync::Weak::new(), false);
        let mut policy = ExitPolicy::default();
        policy.push_reject(Some(("10.0.0.0".parse().unwrap(), 8)), 1, 65535);
        policy.push_accept(None, 80, 80);
        circ.hops
            .lock()
            .expect("poisoned lock")
            .push(Relay::new("exit", [9; 20], "192.0.2.9:9001", 0, policy));

        let ok = ExitTarget::from_address("192.0.2.5".parse().unwrap(), 80);
        let blocked = ExitTarget::from_address("10.9.9.9".parse().unwrap(), 80);
        assert!(circ.can_handle_exit_to(&ok));
        assert!(!circ.can_handle_exit_to(&blocked));
        // Hostname targets skip address-specific rules.
        assert!(circ.can_handle_exit_to(&ExitTarget::from_hostname("example.com", 80)));
    }
}
