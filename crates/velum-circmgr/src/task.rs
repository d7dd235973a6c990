//! The periodic circuit-creation task.
//!
//! One tick at a time, this task looks at the registries and the
//! pending-request queue, decides how many circuits to launch, performs
//! upkeep on the ones we have, and tries to attach pending requests.

use crate::{build, CircMgrInner};

use std::sync::{Arc, Weak};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, trace};

/// How many ticks pass between census lines in the debug log.
const CENSUS_EVERY: u64 = 30;

/// The body of the circuit-creation task.  Runs until the manager goes
/// away.
pub(crate) async fn run(mgr: Weak<CircMgrInner>) {
    let tick_len = match mgr.upgrade() {
        Some(mgr) => mgr.config().circuit_timing.tick_interval,
        None => return,
    };
    let mut ticker = interval(tick_len);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut n_ticks: u64 = 0;
    loop {
        ticker.tick().await;
        let Some(mgr) = mgr.upgrade() else {
            break;
        };
        n_ticks += 1;
        if n_ticks % CENSUS_EVERY == 0 {
            let (clean, pending, active) = mgr.counts();
            debug!(
                "CLEAN: {} PENDING: {} ACTIVE: {}",
                clean, pending, active
            );
        }
        tick_once(&mgr).await;
    }
}

/// Run the work of a single tick.
async fn tick_once(mgr: &Arc<CircMgrInner>) {
    expire_circuits(mgr);
    launch_needed_circuits(mgr);
    mgr.attach_pending_requests().await;
}

/// Upkeep: drop circuits that have been dirty for too long.
fn expire_circuits(mgr: &Arc<CircMgrInner>) {
    let max_dirtiness = mgr.config().circuit_timing.max_dirtiness;
    for circuit in mgr.active_circuits() {
        if let Some(dirty) = circuit.time_dirty() {
            if dirty > max_dirtiness {
                debug!("Closing circuit dirty for {:?}: {:?}", dirty, circuit);
                circuit.destroy_circuit();
            }
        }
    }
}

/// Figure out how many circuits we want to start building, and launch
/// them.
fn launch_needed_circuits(mgr: &Arc<CircMgrInner>) {
    let relays = mgr.directory().usable_relays();
    if relays.is_empty() {
        trace!("No usable relays yet; skipping circuit creation");
        return;
    }
    let (n_clean, n_pending, _) = mgr.counts();
    let pooling = &mgr.config().pooling;

    // One circuit per distinct pending port that no clean circuit's
    // exit admits, plus enough to restore the clean floor.
    let pending_ports = mgr.pending_request_ports();
    let uncovered: Vec<_> = pending_ports
        .iter()
        .filter(|p| !mgr.any_clean_circuit_covers(p.port()))
        .copied()
        .collect();

    let mut n_wanted =
        pooling.clean_floor.saturating_sub(n_clean + n_pending) + uncovered.len();
    let room = pooling.max_pending.saturating_sub(n_pending);
    n_wanted = n_wanted.min(room);

    for _ in 0..n_wanted {
        let path = {
            let mut rng = rand::thread_rng();
            match build::plan_exit_path(&mut rng, &relays, &pending_ports) {
                Ok(path) => path,
                Err(e) => {
                    debug!("Can't plan a new circuit: {}", e);
                    break;
                }
            }
        };
        let circuit = mgr.create_circuit(false);
        let build_timeout = mgr.config().circuit_timing.build_timeout;
        let mgr_weak = Arc::downgrade(mgr);
        tokio::spawn(async move {
            match timeout(build_timeout, circuit.open_circuit(path, None)).await {
                Ok(Ok(())) => {
                    // A new open circuit may satisfy waiting requests.
                    if let Some(mgr) = mgr_weak.upgrade() {
                        mgr.attach_pending_requests().await;
                    }
                }
                Ok(Err(_)) => {
                    // open_circuit already logged and cleaned up.
                }
                Err(_elapsed) => {
                    circuit.abandon_build("build timeout exceeded");
                }
            }
        });
    }
}
