//! `cubelink-middleware` – The Bus Gateway
//!
//! Moves `(client id, topic, payload)` messages between the coordination
//! core and bus clients without caring about their meaning.
//!
//! # Modules
//!
//! - [`topic`] – MQTT-style topic names, `+`/`#` filters, and the
//!   `"<address>/<event>"` device topic split.
//! - [`bus`] – [`MessageBus`], the in-process broker core: per-client
//!   delivery queues plus an interceptor stream of every client publish and
//!   disconnect.
//! - [`gateway`] – the [`BrokerGateway`] and [`BusClient`] traits the core is
//!   written against, and [`LocalClient`] for in-process use.
//! - [`ws_broker`] / [`ws_client`] – JSON-over-WebSocket transport so
//!   bridges and controllers can run as separate processes.

pub mod bus;
pub mod gateway;
pub mod topic;
pub mod ws_broker;
pub mod ws_client;

pub use bus::{ClientEvent, ClientHandle, GatewayEvent, GatewayEvents, MessageBus};
pub use gateway::{BrokerGateway, BusClient, LocalClient};
pub use ws_broker::{Frame, WsBroker};
pub use ws_client::WsClient;
