use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque bus client identifier, stable for the life of one bus connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Address of a cube as reported by a scanner or a bridge (e.g. a BLE MAC).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CubeAddress(String);

impl CubeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CubeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CubeAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CubeAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// RGB lamp color shown by a cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LampColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl LampColor {
    /// Lamp state applied to a cube when it first reports `connected`.
    pub const WHITE: LampColor = LampColor::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Wire form of a lamp command: `[r, g, b]`.
    pub fn to_payload(self) -> Vec<u8> {
        vec![self.r, self.g, self.b]
    }
}

impl fmt::Display for LampColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Per-cube telemetry event carried in the second segment of a
/// `"<address>/<event>"` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CubeEvent {
    Connected,
    Disconnected,
    Button,
    Battery,
}

impl CubeEvent {
    pub const ALL: [CubeEvent; 4] = [
        CubeEvent::Connected,
        CubeEvent::Disconnected,
        CubeEvent::Button,
        CubeEvent::Battery,
    ];

    /// Resolve a topic segment into an event. Unknown segments yield `None`.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "connected" => Some(CubeEvent::Connected),
            "disconnected" => Some(CubeEvent::Disconnected),
            "button" => Some(CubeEvent::Button),
            "battery" => Some(CubeEvent::Battery),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CubeEvent::Connected => "connected",
            CubeEvent::Disconnected => "disconnected",
            CubeEvent::Button => "button",
            CubeEvent::Battery => "battery",
        }
    }

    /// Wildcard subscription filter matching this event for every cube,
    /// e.g. `"+/battery"`.
    pub fn wildcard_filter(self) -> String {
        format!("+/{}", self.as_str())
    }
}

impl fmt::Display for CubeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound bus message: `(sender, topic, payload)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub sender: ClientId,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(sender: impl Into<ClientId>, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sender: sender.into(),
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload decoded as text. Invalid UTF-8 is replaced, never rejected.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// State changes exposed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    BridgeAdded {
        bridge: ClientId,
        capacity: usize,
    },
    BridgeRemoved {
        bridge: ClientId,
        released: Vec<CubeAddress>,
    },
    CubeAssigned {
        bridge: ClientId,
        cube: CubeAddress,
    },
    CubeConnected {
        bridge: Option<ClientId>,
        cube: CubeAddress,
    },
    CubeDisconnected {
        cube: CubeAddress,
    },
    LampChanged {
        color: LampColor,
        cubes: Vec<CubeAddress>,
    },
    BatteryChanged {
        cube: CubeAddress,
        level: u8,
    },
}

/// Envelope stamped onto every [`FleetEvent`] as it leaves the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetNotice {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: FleetEvent,
}

impl FleetNotice {
    pub fn now(event: FleetEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Global error type spanning routing, capacity, and transport failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CubeError {
    #[error("Bridge {bridge} is at capacity ({capacity} cubes)")]
    CapacityExceeded { bridge: ClientId, capacity: usize },

    #[error("No bridge available for cube {0}")]
    NoBridgeAvailable(CubeAddress),

    #[error("Unknown bridge: {0}")]
    UnknownBridge(ClientId),

    #[error("Malformed message on '{topic}': {reason}")]
    MalformedMessage { topic: String, reason: String },

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Config Error: {0}")]
    Config(String),
}
