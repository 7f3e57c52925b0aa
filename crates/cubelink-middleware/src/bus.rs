//! In-process publish/subscribe message bus.
//!
//! [`MessageBus`] is the broker core every transport plugs into.  Each
//! connected client gets a [`ClientHandle`] with its own unbounded delivery
//! queue, so one slow client never stalls the others and nothing is dropped
//! for lag.
//!
//! Besides fan-out to subscribers, every client publish is reported on the
//! broker's interceptor stream ([`GatewayEvents`]) together with the
//! sender's identity.  Client disconnects are reported on the same stream,
//! after every message that client published before leaving.
//!
//! Connection is accept-all.  Connecting with an id that is already
//! connected takes the id over: the previous holder is disconnected first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cubelink_types::{BusMessage, ClientId, CubeError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::topic;

/// Event reported to the broker-side consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A client published a message.
    Message(BusMessage),
    /// A client's connection ended (explicitly, by takeover, or by drop).
    ClientDisconnected(ClientId),
}

impl GatewayEvent {
    /// The client this event belongs to.
    pub fn client_id(&self) -> &ClientId {
        match self {
            GatewayEvent::Message(msg) => &msg.sender,
            GatewayEvent::ClientDisconnected(id) => id,
        }
    }
}

/// Event delivered to a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A message on a topic matching one of the client's subscriptions.
    Message { topic: String, payload: Vec<u8> },
    /// The connection is gone; nothing further will be delivered.
    Disconnected,
}

struct ClientSlot {
    conn: u64,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

struct BusInner {
    clients: Mutex<HashMap<ClientId, ClientSlot>>,
    interceptor: mpsc::UnboundedSender<GatewayEvent>,
    next_conn: AtomicU64,
}

/// Shared message bus.  Clone it cheaply; all clones share the same client
/// table and interceptor stream.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("clients", &self.lock_clients().len())
            .finish()
    }
}

impl MessageBus {
    /// Create a bus and the interceptor stream the broker core consumes.
    pub fn new() -> (Self, GatewayEvents) {
        let (interceptor, rx) = mpsc::unbounded_channel();
        let bus = Self {
            inner: Arc::new(BusInner {
                clients: Mutex::new(HashMap::new()),
                interceptor,
                next_conn: AtomicU64::new(1),
            }),
        };
        (bus, GatewayEvents { rx })
    }

    /// Connect `id` and return its handle.
    ///
    /// An existing connection under the same id is taken over: it receives
    /// [`ClientEvent::Disconnected`] and a
    /// [`GatewayEvent::ClientDisconnected`] is reported before the new
    /// connection is registered.
    pub fn connect(&self, id: impl Into<ClientId>) -> ClientHandle {
        let id = id.into();
        let conn = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut clients = self.lock_clients();
            let previous = clients.insert(
                id.clone(),
                ClientSlot {
                    conn,
                    filters: Vec::new(),
                    tx,
                },
            );
            // Reported before the lock is released so the new session's
            // first publish cannot overtake it.
            if let Some(old) = previous {
                info!(client_id = %id, "client session taken over");
                let _ = old.tx.send(ClientEvent::Disconnected);
                self.intercept(GatewayEvent::ClientDisconnected(id.clone()));
            }
        }
        info!(client_id = %id, "client connected");

        ClientHandle {
            id,
            conn,
            bus: self.clone(),
            rx,
        }
    }

    /// Forcefully disconnect `id`.  Returns `false` if it was not connected.
    pub fn disconnect_client(&self, id: &ClientId) -> bool {
        let mut clients = self.lock_clients();
        match clients.remove(id) {
            Some(slot) => {
                let _ = slot.tx.send(ClientEvent::Disconnected);
                info!(client_id = %id, "client disconnected by broker");
                self.intercept(GatewayEvent::ClientDisconnected(id.clone()));
                true
            }
            None => false,
        }
    }

    /// `true` if `id` currently holds a connection.
    pub fn is_connected(&self, id: &ClientId) -> bool {
        self.lock_clients().contains_key(id)
    }

    /// Publish as the broker itself.  The message is delivered to matching
    /// subscribers but is not reported on the interceptor stream.
    ///
    /// Returns the number of clients the message was handed to; zero
    /// subscribers is not an error.
    pub fn publish_from_broker(&self, topic: &str, payload: Vec<u8>) -> Result<usize, CubeError> {
        if !topic::is_valid_topic(topic) {
            return Err(CubeError::MalformedMessage {
                topic: topic.to_string(),
                reason: "invalid topic name".to_string(),
            });
        }
        Ok(self.fan_out(topic, &payload))
    }

    fn publish_from(&self, sender: &ClientId, conn: u64, topic: &str, payload: Vec<u8>) -> Result<usize, CubeError> {
        if !topic::is_valid_topic(topic) {
            return Err(CubeError::MalformedMessage {
                topic: topic.to_string(),
                reason: "invalid topic name".to_string(),
            });
        }
        let clients = self.lock_clients();
        if !matches!(clients.get(sender), Some(slot) if slot.conn == conn) {
            return Err(CubeError::Transport(format!("client {sender} is not connected")));
        }
        let delivered = deliver(&clients, topic, &payload);
        // Still under the lock: a disconnect racing this publish is always
        // reported after the message.
        self.intercept(GatewayEvent::Message(BusMessage {
            sender: sender.clone(),
            topic: topic.to_string(),
            payload,
        }));
        Ok(delivered)
    }

    fn subscribe(&self, id: &ClientId, conn: u64, filter: &str) -> Result<(), CubeError> {
        if !topic::is_valid_filter(filter) {
            return Err(CubeError::MalformedMessage {
                topic: filter.to_string(),
                reason: "invalid subscription filter".to_string(),
            });
        }
        let mut clients = self.lock_clients();
        match clients.get_mut(id) {
            Some(slot) if slot.conn == conn => {
                if !slot.filters.iter().any(|f| f == filter) {
                    slot.filters.push(filter.to_string());
                }
                debug!(client_id = %id, filter, "subscription accepted");
                Ok(())
            }
            _ => Err(CubeError::Transport(format!("client {id} is not connected"))),
        }
    }

    fn fan_out(&self, topic: &str, payload: &[u8]) -> usize {
        deliver(&self.lock_clients(), topic, payload)
    }

    // Only removes the slot if it still belongs to this connection; a
    // takeover may have replaced it already.
    fn release(&self, id: &ClientId, conn: u64) {
        let mut clients = self.lock_clients();
        let owned = matches!(clients.get(id), Some(slot) if slot.conn == conn);
        if owned && clients.remove(id).is_some() {
            info!(client_id = %id, "client disconnected");
            self.intercept(GatewayEvent::ClientDisconnected(id.clone()));
        }
    }

    fn holds(&self, id: &ClientId, conn: u64) -> bool {
        matches!(self.lock_clients().get(id), Some(slot) if slot.conn == conn)
    }

    fn intercept(&self, event: GatewayEvent) {
        if self.inner.interceptor.send(event).is_err() {
            trace!("interceptor stream closed; event discarded");
        }
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<ClientId, ClientSlot>> {
        self.inner.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(clients: &HashMap<ClientId, ClientSlot>, topic: &str, payload: &[u8]) -> usize {
    let mut delivered = 0;
    for (id, slot) in clients.iter() {
        if slot.filters.iter().any(|f| topic::matches(f, topic)) {
            let event = ClientEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if slot.tx.send(event).is_ok() {
                delivered += 1;
            } else {
                trace!(client_id = %id, topic, "delivery to closed client skipped");
            }
        }
    }
    delivered
}

// ---------------------------------------------------------------------------
// Broker-side stream
// ---------------------------------------------------------------------------

/// The broker's view of the bus: every client publish and disconnect, in
/// the order they happened.
pub struct GatewayEvents {
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
}

impl GatewayEvents {
    /// Wait for the next event.  Returns `None` once every bus clone is gone.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Client-side handle
// ---------------------------------------------------------------------------

/// One client's connection to the [`MessageBus`].  Dropping the handle
/// disconnects the client.
pub struct ClientHandle {
    id: ClientId,
    conn: u64,
    bus: MessageBus,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientHandle {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Add a subscription filter.  Subscribing twice to the same filter is
    /// a no-op.
    pub fn subscribe(&self, filter: &str) -> Result<(), CubeError> {
        self.bus.subscribe(&self.id, self.conn, filter)
    }

    /// Publish under this client's identity.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<usize, CubeError> {
        self.bus.publish_from(&self.id, self.conn, topic, payload.into())
    }

    /// Wait for the next delivery.  After the connection ends this yields
    /// [`ClientEvent::Disconnected`] once and then `None`.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    /// `true` while this handle still owns its id on the bus.
    pub fn is_connected(&self) -> bool {
        self.bus.holds(&self.id, self.conn)
    }

    /// Disconnect explicitly.  Equivalent to dropping the handle.
    pub fn disconnect(self) {}
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.bus.release(&self.id, self.conn);
    }
}
