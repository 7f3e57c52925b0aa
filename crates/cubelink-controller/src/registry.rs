//! [`BridgeRegistry`] – live bridges and the cube assignment algorithm.
//!
//! # Assignment
//!
//! [`BridgeRegistry::assign`] is a greedy least-loaded policy:
//!
//! 1. keep bridges that are not busy and below capacity;
//! 2. pick the one with the fewest attached cubes, ties going to the bridge
//!    that registered first;
//! 3. mark it busy and attach the cube.
//!
//! The busy flag is a single-flight gate: a bridge receives no second
//! assignment until the first one's command has been published and
//! [`BridgeRegistry::complete_handshake`] is called for the same session.
//!
//! # Stale handshakes
//!
//! With a handshake timeout configured, a bridge that has been busy for
//! longer than the timeout is released by
//! [`BridgeRegistry::reap_stale_handshakes`].  Without one, a lost
//! completion leaves the bridge busy until it disconnects.

use std::collections::HashMap;
use std::time::Duration;

use cubelink_types::{ClientId, CubeAddress, CubeError};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::protocol::Outbound;
use crate::session::{BridgeSession, BridgeSnapshot};

/// An assignment in flight: the command to publish and the identity of the
/// session it was issued against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub bridge: ClientId,
    pub session: u64,
    pub cube: CubeAddress,
    pub command: Outbound,
}

#[derive(Debug)]
pub struct BridgeRegistry {
    bridges: HashMap<ClientId, BridgeSession>,
    capacity: usize,
    handshake_timeout: Option<Duration>,
    next_session: u64,
}

impl BridgeRegistry {
    /// Create an empty registry whose bridges each hold up to `capacity`
    /// cubes.
    pub fn new(capacity: usize, handshake_timeout: Option<Duration>) -> Self {
        Self {
            bridges: HashMap::new(),
            capacity,
            handshake_timeout,
            next_session: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register `id` as a bridge.  Returns `false` (and changes nothing) if
    /// it is already registered.
    pub fn register(&mut self, id: &ClientId) -> bool {
        if self.bridges.contains_key(id) {
            return false;
        }
        let session = self.next_session;
        self.next_session += 1;
        self.bridges
            .insert(id.clone(), BridgeSession::new(id.clone(), session, self.capacity));
        info!(bridge = %id, session, capacity = self.capacity, "bridge registered");
        true
    }

    /// Remove `id`, returning its session for cleanup.  Unknown ids yield
    /// `None`.
    pub fn remove(&mut self, id: &ClientId) -> Option<BridgeSession> {
        let removed = self.bridges.remove(id);
        if let Some(session) = &removed {
            info!(bridge = %id, session = session.session(), cubes = session.attached_count(), "bridge removed");
        }
        removed
    }

    pub fn get(&self, id: &ClientId) -> Option<&BridgeSession> {
        self.bridges.get(id)
    }

    pub fn get_mut(&mut self, id: &ClientId) -> Option<&mut BridgeSession> {
        self.bridges.get_mut(id)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.bridges.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// The bridge the next assignment would go to, if any.
    pub fn select(&self) -> Option<&BridgeSession> {
        self.bridges
            .values()
            .filter(|b| b.is_eligible())
            .min_by_key(|b| (b.attached_count(), b.session()))
    }

    /// Pick a bridge for `cube`, close its busy gate and attach the cube.
    ///
    /// # Errors
    ///
    /// * [`CubeError::NoBridgeAvailable`] when every bridge is busy or full.
    /// * [`CubeError::CapacityExceeded`] if the chosen bridge turns out to be
    ///   full; its gate is reopened.
    pub fn assign(&mut self, cube: &CubeAddress, now: Instant) -> Result<Assignment, CubeError> {
        let id = self
            .select()
            .map(|b| b.id().clone())
            .ok_or_else(|| CubeError::NoBridgeAvailable(cube.clone()))?;
        let bridge = self
            .bridges
            .get_mut(&id)
            .ok_or_else(|| CubeError::UnknownBridge(id.clone()))?;

        bridge.mark_busy(now);
        match bridge.connect(cube.clone()) {
            Ok(command) => Ok(Assignment {
                bridge: id,
                session: bridge.session(),
                cube: cube.clone(),
                command,
            }),
            Err(e) => {
                bridge.clear_busy();
                Err(e)
            }
        }
    }

    /// Reopen the busy gate for the assignment's bridge.
    ///
    /// Returns `false` when the bridge has since been removed or replaced by
    /// a newer registration; the completion is then discarded.
    pub fn complete_handshake(&mut self, id: &ClientId, session: u64) -> bool {
        match self.bridges.get_mut(id) {
            Some(bridge) if bridge.session() == session => {
                bridge.clear_busy();
                true
            }
            _ => false,
        }
    }

    /// Release bridges whose busy gate has been closed for longer than the
    /// handshake timeout.  Returns the released bridge ids.
    pub fn reap_stale_handshakes(&mut self, now: Instant) -> Vec<ClientId> {
        let Some(timeout) = self.handshake_timeout else {
            return Vec::new();
        };
        let mut released = Vec::new();
        for bridge in self.bridges.values_mut() {
            if let Some(since) = bridge.busy_since() {
                if now.saturating_duration_since(since) > timeout {
                    warn!(bridge = %bridge.id(), timeout_ms = timeout.as_millis() as u64, "assignment handshake timed out; releasing busy gate");
                    bridge.clear_busy();
                    released.push(bridge.id().clone());
                }
            }
        }
        released.sort();
        released
    }

    /// Snapshots of every bridge in registration order.
    pub fn snapshots(&self) -> Vec<BridgeSnapshot> {
        let mut snaps: Vec<BridgeSnapshot> = self.bridges.values().map(BridgeSession::snapshot).collect();
        snaps.sort_by_key(|s| s.session);
        snaps
    }
}
