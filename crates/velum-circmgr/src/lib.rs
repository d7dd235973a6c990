//! Manage a set of anonymizing circuits and dispatch streams onto them.
//!
//! # Overview
//!
//! The circuit manager is the policy layer above `velum-proto`: it
//! decides when circuits should exist, builds them along paths chosen
//! from the directory, keeps registries of which circuits are pending,
//! active, and clean, and matches incoming stream requests against the
//! circuits whose exit policies admit them.
//!
//! The two external collaborators are deliberately narrow traits: a
//! [`Directory`](directory::Directory) that lists usable relays, and a
//! [`ChannelProvider`](channels::ChannelProvider) that hands out framed
//! connections to them.  Everything else — the scheduler, the pending
//! request queue, the lifecycle bookkeeping — lives here.
//!
//! # Model
//!
//! Callers ask for streams with
//! [`CircMgr::open_exit_stream_to`]; the request waits in a queue while
//! the periodic circuit-creation task keeps a small pool of clean
//! circuits ready and builds new ones for ports that no current
//! circuit's exit admits.  When a suitable circuit is open, the request
//! is attached to it; failures on one circuit mark that (circuit,
//! target) pair bad and move on to another circuit.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

mod build;
pub mod channels;
mod circuit;
mod config;
pub mod directory;
mod err;
pub mod events;
mod requests;
mod status;
mod task;
mod usage;

pub use circuit::Circuit;
pub use config::{
    CircMgrConfig, CircMgrConfigBuilder, CircuitPooling, CircuitPoolingBuilder, CircuitTiming,
    CircuitTimingBuilder,
};
pub use err::{Error, Result};
pub use requests::{DirectoryStreamRequest, OpenStreamResponse, OpenStreamStatus};
pub use status::CircuitStatus;
pub use usage::{ExitPolicy, ExitTarget, TargetPort, TargetPorts};

use crate::channels::ChannelProvider;
use crate::directory::Directory;
use crate::events::{InitEvent, InitializationTracker};
use crate::requests::{RequestQueue, StreamExitRequest};

use futures::channel::mpsc;
use rand::seq::SliceRandom;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info};

/// A Circuit Manager (CircMgr) manages a set of circuits, attaching
/// streams to them when they're suitable, and launching new ones as
/// needed.
///
/// This is a "handle"; clones of it share state.
#[derive(Clone)]
pub struct CircMgr {
    /// The shared manager state.
    inner: Arc<CircMgrInner>,
}

/// The real state of a circuit manager.
pub(crate) struct CircMgrInner {
    /// Configuration for this manager.
    config: CircMgrConfig,
    /// Our view of the relay directory.
    directory: Arc<dyn Directory>,
    /// Our connection cache.
    channels: Arc<dyn ChannelProvider>,
    /// The circuit registries.
    circuits: Mutex<CircuitLists>,
    /// The queue of pending exit-stream requests.
    requests: RequestQueue,
    /// Sink for initialization-progress events.
    init_events: InitializationTracker,
    /// A weak reference to ourselves, handed to the circuits we create.
    weak_self: std::sync::Weak<CircMgrInner>,
    /// True once the circuit-creation task has been started.
    started: AtomicBool,
}

/// The three registries of circuits.
///
/// Invariants (they hold whenever the lock is released): every open
/// circuit is in `active`; `clean` is a subset of `active`; a destroyed
/// or failed circuit is in none of the three.
#[derive(Default)]
struct CircuitLists {
    /// Circuits that are currently building.
    pending: Vec<Arc<Circuit>>,
    /// Circuits that are built and not yet destroyed.
    active: Vec<Arc<Circuit>>,
    /// Built circuits that have never carried a user stream.
    clean: Vec<Arc<Circuit>>,
}

/// Remove every entry of `list` that is the same allocation as `circ`.
fn remove_circ(list: &mut Vec<Arc<Circuit>>, circ: &Circuit) {
    list.retain(|c| !std::ptr::eq(Arc::as_ptr(c), circ as *const Circuit));
}

impl CircMgr {
    /// Construct a new circuit manager over the given directory and
    /// connection cache.
    ///
    /// For the manager to build circuits on its own, you will need to
    /// call [`CircMgr::start_building_circuits`].
    pub fn new(
        config: CircMgrConfig,
        directory: Arc<dyn Directory>,
        channels: Arc<dyn ChannelProvider>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| CircMgrInner {
            config,
            directory,
            channels,
            circuits: Mutex::new(CircuitLists::default()),
            requests: RequestQueue::default(),
            init_events: InitializationTracker::new(),
            weak_self: weak.clone(),
            started: AtomicBool::new(false),
        });
        CircMgr { inner }
    }

    /// Start the periodic circuit-creation task.
    ///
    /// Idempotent: only the first call starts anything.
    pub fn start_building_circuits(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting circuit creation task");
        tokio::spawn(task::run(Arc::downgrade(&self.inner)));
    }

    /// Create a new, unconnected circuit object.
    ///
    /// The caller is responsible for driving its build with
    /// [`Circuit::open_circuit`]; most callers want the stream API
    /// instead.
    pub fn create_new_circuit(&self, is_directory: bool) -> Arc<Circuit> {
        self.inner.create_circuit(is_directory)
    }

    /// Open an anonymized stream to `hostname`:`port`, letting the exit
    /// relay resolve the name.
    ///
    /// Blocks until a circuit can carry the stream, the configured
    /// request deadline passes, or the request is interrupted.
    pub async fn open_exit_stream_to(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<OpenStreamResponse> {
        self.open_exit_stream_by_request(ExitTarget::from_hostname(hostname, port))
            .await
    }

    /// Open an anonymized stream to a literal IPv4 address and port.
    pub async fn open_exit_stream_to_address(
        &self,
        addr: Ipv4Addr,
        port: u16,
    ) -> Result<OpenStreamResponse> {
        self.open_exit_stream_by_request(ExitTarget::from_address(addr, port))
            .await
    }

    /// Enqueue `target` and wait for the matcher to attach it to a
    /// circuit.
    async fn open_exit_stream_by_request(&self, target: ExitTarget) -> Result<OpenStreamResponse> {
        let (request, rx) = StreamExitRequest::new(target);
        self.inner.requests.push(Arc::clone(&request));
        // However this function exits — completion, deadline, or the
        // caller dropping us — the request must leave the queue.
        let _guard = QueueGuard {
            inner: &self.inner,
            request: Arc::clone(&request),
        };

        let deadline = self.inner.config.circuit_timing.request_timeout;
        match timeout(deadline, rx).await {
            Ok(Ok(response)) => response,
            // The sender went away without an answer: the manager is
            // shutting down.
            Ok(Err(_)) => Err(Error::Interrupted),
            Err(_elapsed) => Ok(OpenStreamResponse::Timeout),
        }
    }

    /// Open a one-hop directory stream, per `request`.
    ///
    /// Exactly one directory circuit is built per call; the configured
    /// initialization events fire in order (circuit built, then stream
    /// opened).
    pub async fn open_directory_stream(
        &self,
        request: DirectoryStreamRequest,
    ) -> Result<OpenStreamResponse> {
        let path = match build::plan_directory_path(request.relay()) {
            Ok(path) => path,
            Err(e) => {
                return Ok(OpenStreamResponse::ConnectionFail { msg: e.to_string() });
            }
        };
        let circuit = self.inner.create_circuit(true);
        let build_timeout = self.inner.config.circuit_timing.build_timeout;
        match timeout(build_timeout, circuit.open_circuit(path, None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Ok(OpenStreamResponse::ConnectionFail {
                    msg: format!("Failed to open circuit: {}", e),
                });
            }
            Err(_elapsed) => {
                circuit.abandon_build("directory circuit build timeout");
                return Ok(OpenStreamResponse::ConnectionFail {
                    msg: "Failed to open circuit: build timed out".into(),
                });
            }
        }
        if let Some(ev) = request.request_event() {
            self.inner.init_events.notify(ev);
        }
        let response = circuit.open_directory_stream().await?;
        if response.is_opened() {
            if let Some(ev) = request.loading_event() {
                self.inner.init_events.notify(ev);
            }
        }
        Ok(response)
    }

    /// Subscribe to initialization-progress events.
    pub fn subscribe_init_events(&self) -> mpsc::UnboundedReceiver<InitEvent> {
        self.inner.init_events.subscribe()
    }

    /// Return the sizes of the (clean, pending, active) registries.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.inner.counts()
    }

    /// Return the number of requests waiting in the queue.
    pub fn n_pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    /// Destroy every circuit and fail every pending request.
    pub fn retire_all_circuits(&self) {
        self.inner.requests.interrupt_all();
        let all: Vec<Arc<Circuit>> = {
            let lists = self.inner.circuits.lock().expect("poisoned lock");
            lists
                .pending
                .iter()
                .chain(lists.active.iter())
                .cloned()
                .collect()
        };
        for circuit in all {
            circuit.destroy_circuit();
        }
    }
}

/// Removes a request from the queue when the caller's wait ends for
/// any reason.
struct QueueGuard<'a> {
    /// The manager whose queue we are guarding.
    inner: &'a Arc<CircMgrInner>,
    /// The request to remove.
    request: Arc<StreamExitRequest>,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.inner.requests.remove(&self.request);
    }
}

impl CircMgrInner {
    /// Return this manager's configuration.
    pub(crate) fn config(&self) -> &CircMgrConfig {
        &self.config
    }

    /// Return this manager's directory.
    pub(crate) fn directory(&self) -> &dyn Directory {
        &*self.directory
    }

    /// Return this manager's connection cache.
    pub(crate) fn channels(&self) -> &dyn ChannelProvider {
        &*self.channels
    }

    /// Create a new unconnected circuit owned by this manager.
    pub(crate) fn create_circuit(&self, is_directory: bool) -> Arc<Circuit> {
        Circuit::new(self.weak_self.clone(), is_directory)
    }

    /// Registry transition: a circuit has started building.
    pub(crate) fn circuit_start_connect(&self, circuit: &Arc<Circuit>) {
        let mut lists = self.circuits.lock().expect("poisoned lock");
        lists.pending.push(Arc::clone(circuit));
    }

    /// Registry transition: a circuit has finished building.
    pub(crate) fn circuit_connected(&self, circuit: &Arc<Circuit>) {
        let mut lists = self.circuits.lock().expect("poisoned lock");
        remove_circ(&mut lists.pending, circuit);
        lists.active.push(Arc::clone(circuit));
        lists.clean.push(Arc::clone(circuit));
    }

    /// Registry transition: a circuit has carried its first stream.
    pub(crate) fn circuit_dirty(&self, circuit: &Circuit) {
        let mut lists = self.circuits.lock().expect("poisoned lock");
        remove_circ(&mut lists.clean, circuit);
    }

    /// Registry transition: a circuit is gone (destroyed or failed).
    ///
    /// The single lock makes this atomic: no reader ever sees a dead
    /// circuit in one set but not another.
    pub(crate) fn circuit_inactive(&self, circuit: &Circuit) {
        let mut lists = self.circuits.lock().expect("poisoned lock");
        remove_circ(&mut lists.pending, circuit);
        remove_circ(&mut lists.active, circuit);
        remove_circ(&mut lists.clean, circuit);
    }

    /// Return the sizes of the (clean, pending, active) registries.
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        let lists = self.circuits.lock().expect("poisoned lock");
        (lists.clean.len(), lists.pending.len(), lists.active.len())
    }

    /// Return a snapshot of the active circuits.
    pub(crate) fn active_circuits(&self) -> Vec<Arc<Circuit>> {
        self.circuits.lock().expect("poisoned lock").active.clone()
    }

    /// Return the active circuits in a fresh random order.
    ///
    /// Random order matters for anonymity: iterating deterministically
    /// would pin all requests for a given destination pattern onto the
    /// same circuit.
    pub(crate) fn randomly_ordered_active_circuits(&self) -> Vec<Arc<Circuit>> {
        let mut circuits = self.active_circuits();
        circuits.shuffle(&mut rand::thread_rng());
        circuits
    }

    /// Return the distinct ports of the pending requests.
    pub(crate) fn pending_request_ports(&self) -> Vec<TargetPort> {
        self.requests.pending_ports()
    }

    /// Return true if some clean circuit's exit admits `port`.
    pub(crate) fn any_clean_circuit_covers(&self, port: u16) -> bool {
        let clean: Vec<Arc<Circuit>> =
            self.circuits.lock().expect("poisoned lock").clean.clone();
        clean
            .iter()
            .any(|c| !c.is_directory_circuit() && c.can_handle_exit_to_port(port))
    }

    /// Try to attach every pending request to some active circuit.
    ///
    /// For each request we walk the active circuits in a fresh random
    /// order; the first whose exit admits the target (and that hasn't
    /// failed on it before) gets to try.  A refusal or timeout marks
    /// that (circuit, target) pair as failed and moves on; a request
    /// with no matching circuit simply stays queued.
    pub(crate) async fn attach_pending_requests(self: &Arc<Self>) {
        for request in self.requests.snapshot() {
            if request.is_completed() {
                continue;
            }
            let circuits = self.randomly_ordered_active_circuits();
            for circuit in circuits {
                if circuit.is_directory_circuit() || !circuit.is_connected() {
                    continue;
                }
                if !circuit.can_handle_exit_to(request.target()) {
                    continue;
                }
                match circuit.open_exit_stream(request.target()).await {
                    Ok(response @ OpenStreamResponse::Opened(_)) => {
                        debug!(
                            "Attached stream request for {} to {:?}",
                            request.target(),
                            circuit
                        );
                        self.requests.complete(&request, Ok(response));
                        break;
                    }
                    Ok(OpenStreamResponse::Timeout) | Ok(OpenStreamResponse::Error { .. }) => {
                        circuit.record_failed_exit_target(request.target());
                    }
                    _ => {
                        // This circuit can't currently carry anything;
                        // leave the request for another one.
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::channels::ChannelProvider;
    use crate::directory::{Directory, Relay};
    use async_trait::async_trait;

    /// A directory with no relays at all.
    struct NoDir;
    impl Directory for NoDir {
        fn usable_relays(&self) -> Vec<Relay> {
            Vec::new()
        }
    }

    /// A connection cache that can't connect to anything.
    struct NoNet;
    #[async_trait]
    impl ChannelProvider for NoNet {
        async fn get_or_launch(&self, relay: &Relay) -> Result<velum_proto::channel::Channel> {
            Err(Error::ChanFailed {
                peer: relay.nickname().to_string(),
                cause: velum_proto::Error::ChannelClosed,
            })
        }
    }

    /// Make a manager with no usable network behind it.
    fn dead_mgr() -> CircMgr {
        CircMgr::new(
            CircMgrConfig::default(),
            Arc::new(NoDir),
            Arc::new(NoNet),
        )
    }

    #[test]
    fn registry_transitions_keep_invariants() {
        let mgr = dead_mgr();
        let circuit = mgr.create_new_circuit(false);

        assert_eq!(mgr.counts(), (0, 0, 0));
        mgr.inner.circuit_start_connect(&circuit);
        assert_eq!(mgr.counts(), (0, 1, 0));
        mgr.inner.circuit_connected(&circuit);
        // clean and active together; pending cleared.
        assert_eq!(mgr.counts(), (1, 0, 1));
        mgr.inner.circuit_dirty(&circuit);
        assert_eq!(mgr.counts(), (0, 0, 1));
        mgr.inner.circuit_inactive(&circuit);
        assert_eq!(mgr.counts(), (0, 0, 0));
        // Removal is idempotent.
        mgr.inner.circuit_inactive(&circuit);
        assert_eq!(mgr.counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn build_fails_without_network() {
        let mgr = dead_mgr();
        let circuit = mgr.create_new_circuit(false);
        let relay = Relay::new(
            "lonely",
            [1; 20],
            "192.0.2.1:9001",
            0,
            crate::usage::ExitPolicy::accept_all(),
        );
        let result = circuit.open_circuit(vec![relay], None).await;
        assert!(result.is_err());
        // A failed build leaves no registry entries behind.
        assert_eq!(mgr.counts(), (0, 0, 0));
        assert!(!circuit.is_connected());
    }
}
