//! [`ControllerDispatcher`] – the broker-role message router.
//!
//! Inbound messages are classified by topic:
//!
//! * `hello` → bridge registration (`"bridge"`), accepted no-op
//!   (`"scanner"`), or a warning for any other mode;
//! * `scanner` / `newcube` → the assignment algorithm;
//! * anything else → the sender's bridge session, or dropped when the
//!   sender is not a registered bridge.
//!
//! All coordination state lives in one [`FleetState`] behind a
//! [`tokio::sync::Mutex`].  The lock is released before anything is
//! published, so a slow transport never stalls other senders.
//!
//! Telemetry-driven commands (lamp colors) are additionally serialised by
//! an outbound lock taken before the state lock and held until every
//! command has been sent.  Commands therefore reach the bus in the order
//! their colors were chosen, and the last lamp sent to each cube matches
//! the directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cubelink_middleware::BrokerGateway;
use cubelink_types::{BusMessage, ClientId, CubeAddress, FleetNotice, LampColor};
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::directory::CubeRecord;
use crate::notify::{DEFAULT_NOTIFY_CAPACITY, FleetNotifier};
use crate::protocol::{HELLO_TOPIC, MODE_BRIDGE, MODE_SCANNER, NEWCUBE_TOPIC, Outbound, SCANNER_TOPIC};
use crate::session::BridgeSnapshot;
use crate::state::FleetState;

/// Cubes a bridge can hold when nothing else is configured.
pub const DEFAULT_BRIDGE_CAPACITY: usize = 4;

/// How long a bridge may stay busy before its gate is forced open.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound side of the broker role: one method per event category the
/// gateway reports.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn on_message(&self, message: BusMessage);

    async fn on_disconnect(&self, client: ClientId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub bridge_capacity: usize,
    /// `None` leaves a bridge busy until it disconnects if its assignment
    /// is never completed.
    pub handshake_timeout: Option<Duration>,
    pub notify_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bridge_capacity: DEFAULT_BRIDGE_CAPACITY,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

pub struct ControllerDispatcher<G: BrokerGateway> {
    state: Mutex<FleetState>,
    /// Lock order: `outbound` before `state`.
    outbound: Mutex<()>,
    gateway: Arc<G>,
    notifier: FleetNotifier,
}

impl<G: BrokerGateway> ControllerDispatcher<G> {
    pub fn new(gateway: Arc<G>, config: ControllerConfig) -> Self {
        let notifier = FleetNotifier::new(config.notify_capacity);
        info!(
            capacity = config.bridge_capacity,
            handshake_timeout_ms = config.handshake_timeout.map(|d| d.as_millis() as u64),
            "controller dispatcher ready"
        );
        Self {
            state: Mutex::new(FleetState::new(
                config.bridge_capacity,
                config.handshake_timeout,
                notifier.clone(),
            )),
            outbound: Mutex::new(()),
            gateway,
            notifier,
        }
    }

    /// Subscribe to the presentation event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetNotice> {
        self.notifier.subscribe()
    }

    pub fn notifier(&self) -> &FleetNotifier {
        &self.notifier
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Classify and handle one inbound message.  Never fails: anything
    /// unroutable is logged and dropped.
    pub async fn on_message(&self, message: BusMessage) {
        if message.sender.is_empty() {
            debug!(topic = %message.topic, "message without sender ignored");
            return;
        }
        debug!(client_id = %message.sender, topic = %message.topic, bytes = message.payload.len(), "inbound message");

        match message.topic.as_str() {
            HELLO_TOPIC => self.on_hello(&message).await,
            SCANNER_TOPIC | NEWCUBE_TOPIC => {
                let address = message.payload_str();
                if address.is_empty() {
                    warn!(client_id = %message.sender, topic = %message.topic, "discovery without cube address dropped");
                    return;
                }
                self.on_discovery(CubeAddress::new(address.into_owned())).await;
            }
            _ => self.on_bridge_payload(&message).await,
        }
    }

    async fn on_hello(&self, message: &BusMessage) {
        let mode = message.payload_str();
        match &*mode {
            MODE_BRIDGE => {
                self.state.lock().await.register_bridge(&message.sender);
            }
            MODE_SCANNER => {
                debug!(client_id = %message.sender, "scanner announced");
            }
            other => {
                warn!(client_id = %message.sender, mode = %other, "unknown hello mode; message dropped");
            }
        }
    }

    async fn on_discovery(&self, cube: CubeAddress) {
        let assignment = self.state.lock().await.assign_cube(&cube, Instant::now());
        let Some(assignment) = assignment else {
            return;
        };

        let command = &assignment.command;
        match self.gateway.publish(&command.topic, command.payload.clone()).await {
            Ok(()) => {
                self.state.lock().await.complete_assignment(&assignment);
            }
            Err(e) => {
                warn!(
                    bridge = %assignment.bridge,
                    cube = %assignment.cube,
                    error = %e,
                    "assignment publish failed; bridge stays busy"
                );
            }
        }
    }

    async fn on_bridge_payload(&self, message: &BusMessage) {
        let _order = self.outbound.lock().await;
        let result = {
            let mut state = self.state.lock().await;
            if !state.registry().contains(&message.sender) {
                debug!(client_id = %message.sender, topic = %message.topic, "message from unregistered client dropped");
                return;
            }
            state.bridge_payload(&message.sender, &message.topic, &message.payload)
        };
        match result {
            Ok(commands) => self.send_all(commands).await,
            Err(e) => warn!(bridge = %message.sender, topic = %message.topic, error = %e, "bridge message dropped"),
        }
    }

    /// A client's bus connection ended.  Removes it if it was a bridge.
    pub async fn on_client_disconnected(&self, client: &ClientId) {
        let released = self.state.lock().await.remove_bridge(client);
        match released {
            Some(cubes) => info!(bridge = %client, released = cubes.len(), "bridge disconnected"),
            None => debug!(client_id = %client, "non-bridge client disconnected"),
        }
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Light every connected cube with `color`.
    pub async fn broadcast_lamp(&self, color: LampColor) {
        let _order = self.outbound.lock().await;
        let commands = self.state.lock().await.broadcast_lamp(color);
        self.send_all(commands).await;
    }

    /// Force open busy gates older than the handshake timeout.
    pub async fn reap_stale_handshakes(&self) -> Vec<ClientId> {
        self.state.lock().await.reap_stale_handshakes(Instant::now())
    }

    // -----------------------------------------------------------------------
    // Read API
    // -----------------------------------------------------------------------

    pub async fn bridges(&self) -> Vec<BridgeSnapshot> {
        self.state.lock().await.bridges()
    }

    pub async fn cube(&self, address: &CubeAddress) -> Option<CubeRecord> {
        self.state.lock().await.cube(address)
    }

    async fn send_all(&self, commands: Vec<Outbound>) {
        for Outbound { topic, payload } in commands {
            if let Err(e) = self.gateway.publish(&topic, payload).await {
                warn!(topic = %topic, error = %e, "publish failed");
            }
        }
    }
}

#[async_trait]
impl<G: BrokerGateway + 'static> MessageConsumer for ControllerDispatcher<G> {
    async fn on_message(&self, message: BusMessage) {
        ControllerDispatcher::on_message(self, message).await;
    }

    async fn on_disconnect(&self, client: ClientId) {
        self.on_client_disconnected(&client).await;
    }
}
