//! The seams between the coordination core and the transport.
//!
//! The core never talks to a socket directly.  On the broker side it
//! publishes through a [`BrokerGateway`]; in the client role it drives a
//! [`BusClient`].  Both are implemented by the in-process
//! [`MessageBus`] and by the WebSocket transport.

use async_trait::async_trait;
use cubelink_types::{ClientId, CubeError};

use crate::bus::{ClientEvent, ClientHandle, MessageBus};

/// Outbound side of the broker role.
///
/// # Contract
///
/// * `publish` hands `payload` to every subscriber of `topic`.  Having no
///   subscribers is not an error; `Err` means the transport itself failed.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CubeError>;
}

#[async_trait]
impl BrokerGateway for MessageBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CubeError> {
        self.publish_from_broker(topic, payload).map(|_| ())
    }
}

/// A single durable bus connection held by a process acting as a client.
///
/// # Contract
///
/// * `connect` establishes (or re-establishes) the connection.  Earlier
///   subscriptions are not carried over; the caller resubscribes.
/// * `next_event` waits for the next delivery.  When there is no live
///   connection it returns [`ClientEvent::Disconnected`] immediately.
#[async_trait]
pub trait BusClient: Send {
    fn client_id(&self) -> &ClientId;

    async fn connect(&mut self) -> Result<(), CubeError>;

    async fn subscribe(&mut self, filter: &str) -> Result<(), CubeError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), CubeError>;

    async fn next_event(&mut self) -> ClientEvent;
}

/// [`BusClient`] backed by an in-process [`MessageBus`].
pub struct LocalClient {
    bus: MessageBus,
    id: ClientId,
    handle: Option<ClientHandle>,
}

impl LocalClient {
    pub fn new(bus: MessageBus, id: impl Into<ClientId>) -> Self {
        Self {
            bus,
            id: id.into(),
            handle: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(ClientHandle::is_connected)
    }

    fn live_handle(&self) -> Result<&ClientHandle, CubeError> {
        self.handle
            .as_ref()
            .ok_or_else(|| CubeError::Transport(format!("client {} is not connected", self.id)))
    }
}

#[async_trait]
impl BusClient for LocalClient {
    fn client_id(&self) -> &ClientId {
        &self.id
    }

    async fn connect(&mut self) -> Result<(), CubeError> {
        // Drop the stale handle first so its release cannot race the new one.
        self.handle = None;
        self.handle = Some(self.bus.connect(self.id.clone()));
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), CubeError> {
        self.live_handle()?.subscribe(filter)
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), CubeError> {
        self.live_handle()?.publish(topic, payload).map(|_| ())
    }

    async fn next_event(&mut self) -> ClientEvent {
        let Some(handle) = self.handle.as_mut() else {
            return ClientEvent::Disconnected;
        };
        match handle.recv().await {
            Some(ClientEvent::Message { topic, payload }) => ClientEvent::Message { topic, payload },
            Some(ClientEvent::Disconnected) | None => {
                self.handle = None;
                ClientEvent::Disconnected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_client_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, _events) = MessageBus::new();
        let mut client = LocalClient::new(bus.clone(), "controller");
        client.connect().await?;
        client.subscribe("+/button").await?;

        let bridge = bus.connect("bridge-1");
        bridge.publish("c1/button", vec![1])?;

        assert_eq!(
            client.next_event().await,
            ClientEvent::Message {
                topic: "c1/button".to_string(),
                payload: vec![1],
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn local_client_reports_disconnect_and_stays_down() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, _events) = MessageBus::new();
        let mut client = LocalClient::new(bus.clone(), "controller");
        client.connect().await?;
        assert!(client.is_connected());

        bus.disconnect_client(client.client_id());
        assert_eq!(client.next_event().await, ClientEvent::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.next_event().await, ClientEvent::Disconnected);
        assert!(client.publish("c1/lamp", vec![0, 0, 0]).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn broker_gateway_publish_without_subscribers_is_ok() {
        let (bus, _events) = MessageBus::new();
        let gateway: &dyn BrokerGateway = &bus;
        assert!(gateway.publish("bridge-1/connect", b"c1".to_vec()).await.is_ok());
        assert!(gateway.publish("bad/+", vec![]).await.is_err());
    }
}
