//! WebSocket transport for the [`MessageBus`].
//!
//! Each WebSocket connection is one bus client.  Frames are JSON text
//! messages tagged by `op`:
//!
//! | Direction | Frame |
//! |---|---|
//! | client → broker | `{"op":"connect","client_id":"bridge-1"}` (must be first) |
//! | broker → client | `{"op":"connack"}` |
//! | client → broker | `{"op":"subscribe","filter":"bridge-1/connect"}` |
//! | client → broker | `{"op":"publish","topic":"hello","payload":[98,114,...]}` |
//! | broker → client | `{"op":"message","topic":"bridge-1/connect","payload":[...]}` |
//! | broker → client | `{"op":"error","reason":"..."}` |
//!
//! Connections are accepted unconditionally.  The socket closing is the
//! client's disconnect.

use std::net::SocketAddr;

use cubelink_types::{ClientId, CubeError};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{ClientEvent, MessageBus};

/// One WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Connect { client_id: ClientId },
    Connack,
    Subscribe { filter: String },
    Publish { topic: String, payload: Vec<u8> },
    Message { topic: String, payload: Vec<u8> },
    Error { reason: String },
}

impl Frame {
    pub fn to_message(&self) -> Result<Message, CubeError> {
        let json = serde_json::to_string(self).map_err(|e| CubeError::Transport(e.to_string()))?;
        Ok(Message::Text(json.into()))
    }

    pub fn parse(text: &str) -> Result<Self, CubeError> {
        serde_json::from_str(text).map_err(|e| CubeError::MalformedMessage {
            topic: "<frame>".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Serves a [`MessageBus`] to WebSocket clients.
#[derive(Clone)]
pub struct WsBroker {
    bus: MessageBus,
}

impl WsBroker {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    /// Bind `addr` and serve until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`CubeError::Transport`] if the listener cannot be bound.
    pub async fn run(self, addr: SocketAddr) -> Result<(), CubeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CubeError::Transport(format!("ws bind error on {addr}: {e}")))?;
        info!(%addr, "broker listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections from an already bound listener, forever.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let broker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = broker.handle_socket(stream, peer).await {
                            warn!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "ws accept error");
                }
            }
        }
    }

    async fn handle_socket(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), CubeError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| CubeError::Transport(format!("ws handshake from {peer}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // The first frame names the client.
        let client_id = loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str())? {
                    Frame::Connect { client_id } if !client_id.is_empty() => break client_id,
                    other => {
                        let reject = Frame::Error {
                            reason: "first frame must be a connect with a client id".to_string(),
                        };
                        let _ = ws_tx.send(reject.to_message()?).await;
                        return Err(CubeError::MalformedMessage {
                            topic: "<frame>".to_string(),
                            reason: format!("expected connect, got {other:?}"),
                        });
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(CubeError::Transport(e.to_string())),
            }
        };

        info!(client_id = %client_id, peer = %peer, "new connection");
        let mut handle = self.bus.connect(client_id.clone());
        ws_tx
            .send(Frame::Connack.to_message()?)
            .await
            .map_err(|e| CubeError::Transport(e.to_string()))?;

        loop {
            tokio::select! {
                delivery = handle.recv() => {
                    match delivery {
                        Some(ClientEvent::Message { topic, payload }) => {
                            let frame = Frame::Message { topic, payload };
                            if ws_tx.send(frame.to_message()?).await.is_err() {
                                break;
                            }
                        }
                        // Taken over by a newer connection with the same id.
                        Some(ClientEvent::Disconnected) | None => break,
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(client_id = %client_id, error = %e, "ws read error");
                            break;
                        }
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_frame(&handle, text.as_str()) {
                                if ws_tx.send(reply.to_message()?).await.is_err() {
                                    break;
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        // Dropping the handle reports the disconnect to the bus.
        drop(handle);
        let _ = ws_tx.close().await;
        Ok(())
    }

    /// Apply one client frame.  Returns an error frame to send back, if any.
    fn handle_frame(&self, handle: &crate::bus::ClientHandle, text: &str) -> Option<Frame> {
        let result = match Frame::parse(text) {
            Ok(Frame::Subscribe { filter }) => {
                let result = handle.subscribe(&filter);
                match &result {
                    Ok(()) => info!(client_id = %handle.id(), filter = %filter, "new subscription"),
                    Err(e) => warn!(client_id = %handle.id(), filter = %filter, error = %e, "subscription failed"),
                }
                result
            }
            Ok(Frame::Publish { topic, payload }) => handle.publish(&topic, payload).map(|_| ()),
            Ok(other) => Err(CubeError::MalformedMessage {
                topic: "<frame>".to_string(),
                reason: format!("unexpected frame from client: {other:?}"),
            }),
            Err(e) => Err(e),
        };
        result.err().map(|e| Frame::Error { reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_by_op() -> Result<(), Box<dyn std::error::Error>> {
        let frame = Frame::Publish {
            topic: "hello".to_string(),
            payload: b"bridge".to_vec(),
        };
        let json = serde_json::to_string(&frame)?;
        assert!(json.contains("\"op\":\"publish\""));
        assert_eq!(Frame::parse(&json)?, frame);

        let connect = Frame::parse(r#"{"op":"connect","client_id":"bridge-1"}"#)?;
        assert_eq!(
            connect,
            Frame::Connect {
                client_id: ClientId::new("bridge-1")
            }
        );
        Ok(())
    }

    #[test]
    fn unknown_op_is_malformed() {
        assert!(matches!(
            Frame::parse(r#"{"op":"teleport"}"#),
            Err(CubeError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn handle_frame_reports_bad_subscription() {
        let (bus, _events) = MessageBus::new();
        let broker = WsBroker::new(bus.clone());
        let handle = bus.connect("bridge-1");

        let reply = broker.handle_frame(&handle, r#"{"op":"subscribe","filter":"a/#/b"}"#);
        assert!(matches!(reply, Some(Frame::Error { .. })));

        let reply = broker.handle_frame(&handle, r#"{"op":"subscribe","filter":"bridge-1/connect"}"#);
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn handle_frame_publishes_under_client_identity() {
        let (bus, mut events) = MessageBus::new();
        let broker = WsBroker::new(bus.clone());
        let handle = bus.connect("bridge-1");

        let reply = broker.handle_frame(&handle, r#"{"op":"publish","topic":"hello","payload":[98,114,105,100,103,101]}"#);
        assert_eq!(reply, None);
        match events.recv().await {
            Some(crate::bus::GatewayEvent::Message(msg)) => {
                assert_eq!(msg.sender, ClientId::new("bridge-1"));
                assert_eq!(msg.payload_str(), "bridge");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }
}
