//! Periodic circuit build scheduler
//!
//! One task per manager. Each tick it expires stale requests, matches
//! pending requests against the registry, performs circuit upkeep, and
//! decides how many new circuits to build: a floor of clean
//! general-purpose circuits, plus one build per distinct pending exit
//! port that no clean circuit's exit currently admits.
//!
//! Builds run on their own tasks so a slow handshake never stalls the
//! tick; after every successful build the matcher runs again.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::circuit::stream::OpenStreamResponse;
use crate::circuit::{Circuit, CircuitKind};
use crate::manager::CircuitManager;
use crate::path;

/// Spawn the scheduler task for `manager`.
pub(crate) fn spawn(manager: &Arc<CircuitManager>) -> JoinHandle<()> {
    let weak = Arc::downgrade(manager);
    tokio::spawn(async move {
        loop {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if manager.is_shutting_down() {
                return;
            }
            tick(&manager).await;
            manager.wait_for_tick().await;
        }
    })
}

/// One scheduler pass.
async fn tick(manager: &Arc<CircuitManager>) {
    let expired = manager
        .requests()
        .expire_older_than(manager.config().request_deadline);
    if expired > 0 {
        manager.note_requests_timed_out(expired);
    }

    match_requests(manager).await;
    upkeep(manager).await;
    plan_builds(manager);
}

/// Try to serve every pending request from the active circuits.
///
/// Circuits are probed in randomized order so repeated requests for the
/// same destination pattern do not pin onto a single circuit.
async fn match_requests(manager: &Arc<CircuitManager>) {
    for request in manager.requests().pending() {
        if request.is_complete() {
            continue;
        }

        let mut candidates = manager.registry().active_snapshot();
        manager.rng().shuffle(&mut candidates);

        for circuit in candidates {
            if !circuit.can_handle_exit_to(&request.target) {
                continue;
            }
            match circuit.open_exit_stream(&request.target).await {
                Ok(stream) => {
                    log::debug!(
                        "Matched request for {} onto circuit {}",
                        request.target,
                        circuit.serial()
                    );
                    if manager
                        .requests()
                        .complete(&request, OpenStreamResponse::opened(stream))
                    {
                        manager.note_stream_opened();
                    }
                    break;
                }
                Err(e) => {
                    log::info!(
                        "Circuit {} failed exit to {}: {}",
                        circuit.serial(),
                        request.target,
                        e
                    );
                    circuit.record_failed_exit_target(&request.target);
                    // Keep searching on the remaining circuits.
                }
            }
        }
    }
}

/// Close circuits that have outlived their usefulness.
async fn upkeep(manager: &Arc<CircuitManager>) {
    let max_dirty = manager.config().max_dirty_lifetime.as_millis();
    for circuit in manager.registry().active_snapshot() {
        if circuit.is_dirty() && circuit.milliseconds_dirty() > max_dirty {
            log::info!("Circuit {} dirty too long, destroying", circuit.serial());
            circuit.destroy_circuit().await;
        }
    }

    let build_timeout = manager.config().build_timeout.as_millis();
    for circuit in manager.registry().pending_snapshot() {
        if circuit.is_building() && circuit.milliseconds_since_creation() > build_timeout {
            log::info!(
                "Circuit {} exceeded the build timeout, destroying",
                circuit.serial()
            );
            circuit.destroy_circuit().await;
        }
    }
}

/// Decide how many circuits to launch this tick, and launch them.
fn plan_builds(manager: &Arc<CircuitManager>) {
    let pending = manager.registry().pending_count();
    let clean: Vec<Arc<Circuit>> = manager
        .registry()
        .clean_snapshot()
        .into_iter()
        .filter(|c| !c.is_directory())
        .collect();

    // One build per distinct pending port no clean exit admits.
    let pending_ports = manager.requests().pending_ports();
    let mut hints: Vec<Option<u16>> = Vec::new();
    for port in &pending_ports {
        let served = clean.iter().any(|c| {
            c.last_relay()
                .map(|r| r.exit_policy.accepts_port(*port))
                .unwrap_or(false)
        });
        if !served {
            hints.push(Some(*port));
        }
    }

    // Keep the clean floor topped up.
    let deficit = manager
        .config()
        .clean_circuit_floor
        .saturating_sub(clean.len() + pending + hints.len());
    hints.extend(std::iter::repeat(None).take(deficit));

    // Enforce the pending-build cap.
    let room = manager
        .config()
        .max_pending_circuits
        .saturating_sub(pending);
    hints.truncate(room);

    for hint in hints {
        let path = match path::choose_path(
            manager.directory().as_ref(),
            manager.rng(),
            hint,
            &pending_ports,
        ) {
            Ok(path) => path,
            Err(e) => {
                log::debug!("No path for build (hint {:?}): {}", hint, e);
                continue;
            }
        };

        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            let circuit = manager.create_new_circuit(CircuitKind::General);
            let attempted = circuit
                .open_circuit(path, &**manager.build_events())
                .await;
            if attempted && circuit.is_connected() {
                manager.note_circuit_built();
                // Drain the queue against the new circuit right away.
                manager.requests().kick();
            } else {
                manager.note_circuit_failed();
            }
        });
    }
}
