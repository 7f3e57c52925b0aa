//! [`BusClient`] over the WebSocket transport served by
//! [`WsBroker`](crate::ws_broker::WsBroker).

use async_trait::async_trait;
use cubelink_types::{ClientId, CubeError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::bus::ClientEvent;
use crate::gateway::BusClient;
use crate::ws_broker::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single WebSocket connection to a broker, identified by `client_id`.
pub struct WsClient {
    url: String,
    client_id: ClientId,
    stream: Option<WsStream>,
}

impl WsClient {
    pub fn new(url: impl Into<String>, client_id: impl Into<ClientId>) -> Self {
        Self {
            url: url.into(),
            client_id: client_id.into(),
            stream: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), CubeError> {
        let message = frame.to_message()?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CubeError::Transport(format!("client {} is not connected", self.client_id)))?;
        if let Err(e) = stream.send(message).await {
            self.stream = None;
            return Err(CubeError::Transport(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BusClient for WsClient {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn connect(&mut self) -> Result<(), CubeError> {
        self.stream = None;
        let (mut stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| CubeError::Transport(format!("connect to {}: {e}", self.url)))?;

        let hello = Frame::Connect {
            client_id: self.client_id.clone(),
        };
        stream
            .send(hello.to_message()?)
            .await
            .map_err(|e| CubeError::Transport(e.to_string()))?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str())? {
                    Frame::Connack => break,
                    Frame::Error { reason } => return Err(CubeError::Transport(reason)),
                    other => trace!(frame = ?other, "ignoring frame before connack"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(CubeError::Transport("connection closed before connack".to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(CubeError::Transport(e.to_string())),
            }
        }

        info!(client_id = %self.client_id, url = %self.url, "connected to broker");
        self.stream = Some(stream);
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), CubeError> {
        self.send_frame(Frame::Subscribe {
            filter: filter.to_string(),
        })
        .await
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), CubeError> {
        self.send_frame(Frame::Publish {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    async fn next_event(&mut self) -> ClientEvent {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return ClientEvent::Disconnected;
            };
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str()) {
                    Ok(Frame::Message { topic, payload }) => return ClientEvent::Message { topic, payload },
                    Ok(Frame::Error { reason }) => warn!(client_id = %self.client_id, %reason, "broker reported an error"),
                    Ok(other) => trace!(frame = ?other, "ignoring frame"),
                    Err(e) => warn!(error = %e, "unparseable frame from broker"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!(client_id = %self.client_id, "broker closed the connection");
                    self.stream = None;
                }
                Some(Err(e)) => {
                    debug!(client_id = %self.client_id, error = %e, "ws read error");
                    self.stream = None;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{GatewayEvent, MessageBus};
    use crate::ws_broker::WsBroker;
    use tokio::net::TcpListener;

    async fn start_broker() -> Result<(MessageBus, crate::bus::GatewayEvents, String), Box<dyn std::error::Error>> {
        let (bus, events) = MessageBus::new();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}", listener.local_addr()?);
        tokio::spawn(WsBroker::new(bus.clone()).serve(listener));
        Ok((bus, events, url))
    }

    #[tokio::test]
    async fn ws_client_subscribes_and_receives() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, mut events, url) = start_broker().await?;

        let mut client = WsClient::new(url, "controller");
        client.connect().await?;
        client.subscribe("+/battery").await?;

        // Wait for the subscription to land before publishing.
        let id = ClientId::new("controller");
        for _ in 0..50 {
            if bus.publish_from_broker("c1/battery", vec![77])? > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(bus.is_connected(&id));

        assert_eq!(
            client.next_event().await,
            ClientEvent::Message {
                topic: "c1/battery".to_string(),
                payload: vec![77],
            }
        );

        client.publish("hello", b"scanner".to_vec()).await?;
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv()).await?;
        assert_eq!(
            event,
            Some(GatewayEvent::Message(cubelink_types::BusMessage::new(
                "controller",
                "hello",
                b"scanner".to_vec()
            )))
        );
        Ok(())
    }

    #[tokio::test]
    async fn ws_client_sees_broker_disconnect() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, _events, url) = start_broker().await?;
        let mut client = WsClient::new(url, "bridge-1");
        client.connect().await?;

        bus.disconnect_client(&ClientId::new("bridge-1"));
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), client.next_event()).await?;
        assert_eq!(event, ClientEvent::Disconnected);
        assert!(!client.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let mut client = WsClient::new("ws://127.0.0.1:1", "controller");
        assert!(matches!(client.connect().await, Err(CubeError::Transport(_))));
    }
}
