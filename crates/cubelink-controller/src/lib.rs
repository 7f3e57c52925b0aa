//! `cubelink-controller` – Broker-role fleet coordination
//!
//! Decides which bridge each discovered cube is routed through, keeps the
//! authoritative view of bridges and cubes, and drives the shared lamp.
//!
//! # Modules
//!
//! - [`dispatcher`] – [`ControllerDispatcher`], the topic router that owns
//!   all coordination state behind one lock.
//! - [`pump`] – [`DispatchPump`], per-sender ordered delivery from the
//!   gateway into the dispatcher.
//! - [`registry`] – [`BridgeRegistry`], live bridges and the least-loaded
//!   assignment algorithm with its single-flight busy gate.
//! - [`session`] – [`BridgeSession`], one bridge and its attached cubes.
//! - [`directory`] – [`CubeDirectory`], last-known state of every cube.
//! - [`telemetry`] – per-cube event handling shared with the client role.
//! - [`state`] – [`FleetState`], the data guarded by the dispatcher lock.
//! - [`notify`] – [`FleetNotifier`], the outward event stream.
//! - [`lamp`] – [`LampCycle`], the button color policy.
//! - [`protocol`] – topic names and outbound command encoding.

pub mod directory;
pub mod dispatcher;
pub mod lamp;
pub mod notify;
pub mod protocol;
pub mod pump;
pub mod registry;
pub mod session;
pub mod state;
pub mod telemetry;

pub use directory::{CubeDirectory, CubeRecord};
pub use dispatcher::{ControllerConfig, ControllerDispatcher, MessageConsumer};
pub use lamp::LampCycle;
pub use notify::FleetNotifier;
pub use protocol::Outbound;
pub use pump::DispatchPump;
pub use registry::{Assignment, BridgeRegistry};
pub use session::{BridgeSession, BridgeSnapshot};
pub use state::FleetState;
pub use telemetry::CubeContext;
