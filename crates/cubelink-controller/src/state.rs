//! [`FleetState`] – everything the dispatcher guards with its single lock.
//!
//! Every method here is synchronous and never publishes.  Operations that
//! need to talk to the bus return [`Outbound`] commands (or an
//! [`Assignment`]) for the caller to send once the lock is released.

use std::time::Duration;

use cubelink_types::{ClientId, CubeAddress, CubeError, CubeEvent, FleetEvent, LampColor};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::directory::{CubeDirectory, CubeRecord};
use crate::lamp::LampCycle;
use crate::notify::FleetNotifier;
use crate::protocol::Outbound;
use crate::registry::{Assignment, BridgeRegistry};
use crate::session::BridgeSnapshot;
use crate::telemetry::{CubeContext, parse_device_topic};

#[derive(Debug)]
pub struct FleetState {
    registry: BridgeRegistry,
    directory: CubeDirectory,
    lamp: LampCycle,
    notifier: FleetNotifier,
}

impl FleetState {
    pub fn new(bridge_capacity: usize, handshake_timeout: Option<Duration>, notifier: FleetNotifier) -> Self {
        Self {
            registry: BridgeRegistry::new(bridge_capacity, handshake_timeout),
            directory: CubeDirectory::new(),
            lamp: LampCycle::new(),
            notifier,
        }
    }

    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &CubeDirectory {
        &self.directory
    }

    // -----------------------------------------------------------------------
    // Bridge lifecycle
    // -----------------------------------------------------------------------

    /// Register `bridge`.  A known id is left untouched and `false` is
    /// returned.
    pub fn register_bridge(&mut self, bridge: &ClientId) -> bool {
        if !self.registry.register(bridge) {
            debug!(bridge = %bridge, "duplicate bridge hello ignored");
            return false;
        }
        self.notifier.notify(FleetEvent::BridgeAdded {
            bridge: bridge.clone(),
            capacity: self.registry.capacity(),
        });
        true
    }

    /// Remove `bridge` and release its cubes.  Returns the released
    /// addresses, or `None` if the id was not a registered bridge.
    pub fn remove_bridge(&mut self, bridge: &ClientId) -> Option<Vec<CubeAddress>> {
        let mut session = self.registry.remove(bridge)?;
        let released = session.dispose(&mut self.directory);
        self.notifier.notify(session.removed_event(released.clone()));
        Some(released)
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    /// Run the assignment algorithm for a discovered cube.
    ///
    /// Returns `None` when the discovery is dropped: the cube already has an
    /// owner, or no bridge can take it right now.
    pub fn assign_cube(&mut self, cube: &CubeAddress, now: Instant) -> Option<Assignment> {
        self.registry.reap_stale_handshakes(now);

        if let Some(owner) = self.directory.owner(cube) {
            info!(cube = %cube, bridge = %owner, "cube already assigned; announcement ignored");
            return None;
        }

        match self.registry.assign(cube, now) {
            Ok(assignment) => {
                let record = self.directory.create_or_update(cube);
                record.owner = Some(assignment.bridge.clone());
                record.connected = false;
                self.notifier.notify(FleetEvent::CubeAssigned {
                    bridge: assignment.bridge.clone(),
                    cube: cube.clone(),
                });
                Some(assignment)
            }
            Err(CubeError::NoBridgeAvailable(_)) => {
                info!(cube = %cube, bridges = self.registry.len(), "no bridges available now");
                None
            }
            Err(e) => {
                warn!(cube = %cube, error = %e, "cube assignment failed");
                None
            }
        }
    }

    /// Reopen the busy gate once the assignment command has been published.
    /// Completions for a bridge that has since gone away are discarded.
    pub fn complete_assignment(&mut self, assignment: &Assignment) -> bool {
        let done = self.registry.complete_handshake(&assignment.bridge, assignment.session);
        if !done {
            debug!(
                bridge = %assignment.bridge,
                session = assignment.session,
                cube = %assignment.cube,
                "completion for departed bridge discarded"
            );
        }
        done
    }

    pub fn reap_stale_handshakes(&mut self, now: Instant) -> Vec<ClientId> {
        self.registry.reap_stale_handshakes(now)
    }

    // -----------------------------------------------------------------------
    // Bridge telemetry
    // -----------------------------------------------------------------------

    /// Forward a cube-scoped message from `bridge` to its session.
    ///
    /// A `connected` report for a cube owned by another bridge moves the
    /// cube over, provided the reporting bridge has room for it.
    ///
    /// # Errors
    ///
    /// * [`CubeError::UnknownBridge`] if `bridge` is not registered.
    /// * [`CubeError::CapacityExceeded`] if the takeover would overfill the
    ///   reporting bridge.
    /// * [`CubeError::MalformedMessage`] for anything that is not a valid
    ///   device topic and payload.
    pub fn bridge_payload(
        &mut self,
        bridge: &ClientId,
        topic: &str,
        payload: &[u8],
    ) -> Result<Vec<Outbound>, CubeError> {
        let session = self
            .registry
            .get(bridge)
            .ok_or_else(|| CubeError::UnknownBridge(bridge.clone()))?;
        let (address, event) = parse_device_topic(topic)?;

        if event == CubeEvent::Connected {
            let previous = self.directory.owner(&address).filter(|owner| *owner != bridge).cloned();
            if let Some(previous) = previous {
                if !session.holds(&address) && !session.has_room() {
                    return Err(CubeError::CapacityExceeded {
                        bridge: bridge.clone(),
                        capacity: session.capacity(),
                    });
                }
                if let Some(old) = self.registry.get_mut(&previous) {
                    old.detach(&address);
                }
                info!(cube = %address, from = %previous, to = %bridge, "cube ownership moved");
            }
        }

        let session = self
            .registry
            .get_mut(bridge)
            .ok_or_else(|| CubeError::UnknownBridge(bridge.clone()))?;
        let mut ctx = CubeContext {
            directory: &mut self.directory,
            lamp: &mut self.lamp,
            notifier: &self.notifier,
        };
        session.process_payload(topic, payload, &mut ctx)
    }

    /// Light every connected cube with `color`.
    pub fn broadcast_lamp(&mut self, color: LampColor) -> Vec<Outbound> {
        CubeContext {
            directory: &mut self.directory,
            lamp: &mut self.lamp,
            notifier: &self.notifier,
        }
        .broadcast_lamp(color)
    }

    // -----------------------------------------------------------------------
    // Read API
    // -----------------------------------------------------------------------

    pub fn bridges(&self) -> Vec<BridgeSnapshot> {
        self.registry.snapshots()
    }

    pub fn cube(&self, address: &CubeAddress) -> Option<CubeRecord> {
        self.directory.get(address).cloned()
    }
}
