//! `cubelink-agent` – Client-role connection keeper
//!
//! When the process joins an existing broker as an ordinary bus client it
//! does not assign cubes.  It watches cube telemetry from every bridge,
//! keeps its own view of the cubes and drives the shared lamp.
//!
//! # Modules
//!
//! - [`reconnect`] – [`ReconnectAgent`][reconnect::ReconnectAgent]:
//!   the `Disconnected → Connecting → Connected` state machine, with
//!   resubscription on every connect and a single delayed reconnect attempt
//!   after a drop.  Works over any
//!   [`BusClient`][cubelink_middleware::BusClient], in-process or WebSocket.

pub mod reconnect;

pub use reconnect::{AgentConfig, AgentExit, AgentHandle, AgentState, DEFAULT_RECONNECT_DELAY, ReconnectAgent};
