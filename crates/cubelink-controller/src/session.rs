//! [`BridgeSession`] – one bridge client and the cubes routed through it.

use cubelink_types::{ClientId, CubeAddress, CubeError, CubeEvent, FleetEvent};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::directory::CubeDirectory;
use crate::protocol::{Outbound, assign_command};
use crate::telemetry::{CubeContext, parse_device_topic};

/// Live state of a registered bridge.
///
/// `session` is a number unique to this registration; a bridge that
/// disconnects and registers again under the same client id gets a new one,
/// so late completions for the old registration can be told apart.
#[derive(Debug, Clone)]
pub struct BridgeSession {
    id: ClientId,
    session: u64,
    capacity: usize,
    attached: Vec<CubeAddress>,
    busy_since: Option<Instant>,
}

/// Read-only copy of a session for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSnapshot {
    pub id: ClientId,
    pub session: u64,
    pub capacity: usize,
    pub cubes: Vec<CubeAddress>,
    pub busy: bool,
}

impl BridgeSession {
    pub fn new(id: ClientId, session: u64, capacity: usize) -> Self {
        Self {
            id,
            session,
            capacity,
            attached: Vec::new(),
            busy_since: None,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn attached(&self) -> &[CubeAddress] {
        &self.attached
    }

    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    pub fn has_room(&self) -> bool {
        self.attached.len() < self.capacity
    }

    pub fn holds(&self, cube: &CubeAddress) -> bool {
        self.attached.contains(cube)
    }

    pub fn is_busy(&self) -> bool {
        self.busy_since.is_some()
    }

    pub fn busy_since(&self) -> Option<Instant> {
        self.busy_since
    }

    /// Eligible for a new assignment: idle and below capacity.
    pub fn is_eligible(&self) -> bool {
        !self.is_busy() && self.has_room()
    }

    pub(crate) fn mark_busy(&mut self, now: Instant) {
        self.busy_since = Some(now);
    }

    pub(crate) fn clear_busy(&mut self) {
        self.busy_since = None;
    }

    /// Add `cube` to the attached set.  Attaching a cube already held is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`CubeError::CapacityExceeded`] when the session is full.
    pub fn attach(&mut self, cube: CubeAddress) -> Result<(), CubeError> {
        if self.holds(&cube) {
            return Ok(());
        }
        if !self.has_room() {
            return Err(CubeError::CapacityExceeded {
                bridge: self.id.clone(),
                capacity: self.capacity,
            });
        }
        self.attached.push(cube);
        Ok(())
    }

    /// Remove `cube` from the attached set.  Returns `false` if it was not
    /// attached.
    pub fn detach(&mut self, cube: &CubeAddress) -> bool {
        let before = self.attached.len();
        self.attached.retain(|c| c != cube);
        self.attached.len() != before
    }

    /// Attach `cube` and build the assignment command for the bridge.
    ///
    /// The caller publishes the returned command and, once the publish
    /// succeeds, clears the busy gate through the registry.
    pub fn connect(&mut self, cube: CubeAddress) -> Result<Outbound, CubeError> {
        self.attach(cube.clone())?;
        info!(bridge = %self.id, cube = %cube, attached = self.attached.len(), "cube assigned");
        Ok(assign_command(&self.id, &cube))
    }

    /// Handle a cube-scoped `"<address>/<event>"` message from this bridge.
    ///
    /// Returns the lamp commands the event produced.
    ///
    /// # Errors
    ///
    /// * [`CubeError::MalformedMessage`] for non-device topics, unknown
    ///   events, and empty payloads where a byte is required.
    /// * [`CubeError::CapacityExceeded`] when the bridge reports a new cube
    ///   while already full.
    pub fn process_payload(
        &mut self,
        topic: &str,
        payload: &[u8],
        ctx: &mut CubeContext<'_>,
    ) -> Result<Vec<Outbound>, CubeError> {
        let (address, event) = parse_device_topic(topic)?;
        match event {
            CubeEvent::Connected => {
                self.attach(address.clone())?;
            }
            CubeEvent::Disconnected => {
                if !self.detach(&address) {
                    debug!(bridge = %self.id, cube = %address, "disconnect for cube not attached here");
                }
            }
            CubeEvent::Button | CubeEvent::Battery => {}
        }
        ctx.apply(Some(&self.id), &address, event, payload)
    }

    /// Release every attached cube back to "unowned" in `directory`.
    /// Returns the released addresses.
    pub fn dispose(&mut self, directory: &mut CubeDirectory) -> Vec<CubeAddress> {
        self.attached.clear();
        self.busy_since = None;
        directory.release_owned_by(&self.id)
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            id: self.id.clone(),
            session: self.session,
            capacity: self.capacity,
            cubes: self.attached.clone(),
            busy: self.is_busy(),
        }
    }

    pub(crate) fn removed_event(&self, released: Vec<CubeAddress>) -> FleetEvent {
        FleetEvent::BridgeRemoved {
            bridge: self.id.clone(),
            released,
        }
    }
}
