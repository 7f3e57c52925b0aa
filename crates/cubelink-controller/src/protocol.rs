//! Topic names and outbound command encoding.
//!
//! # Inbound (broker role)
//!
//! | Topic | Payload |
//! |---|---|
//! | `hello` | `"bridge"` or `"scanner"` |
//! | `scanner`, `newcube` | cube address |
//! | anything else | forwarded to the sender's bridge session |
//!
//! # Outbound
//!
//! | Topic | Payload | Meaning |
//! |---|---|---|
//! | `<bridgeId>/connect` | cube address bytes | bridge must attach this cube |
//! | `<cubeAddress>/lamp` | `[r, g, b]` | set the cube's lamp |

use cubelink_types::{ClientId, CubeAddress, LampColor};

pub const HELLO_TOPIC: &str = "hello";
pub const SCANNER_TOPIC: &str = "scanner";
pub const NEWCUBE_TOPIC: &str = "newcube";

pub const MODE_BRIDGE: &str = "bridge";
pub const MODE_SCANNER: &str = "scanner";

/// Suffix of the per-bridge assignment topic.
pub const CONNECT_SUFFIX: &str = "connect";
/// Suffix of the per-cube lamp topic.
pub const LAMP_SUFFIX: &str = "lamp";

/// A publish the core wants performed once its state lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Assignment command telling `bridge` to attach `cube`.
pub fn assign_command(bridge: &ClientId, cube: &CubeAddress) -> Outbound {
    Outbound {
        topic: format!("{bridge}/{CONNECT_SUFFIX}"),
        payload: cube.as_str().as_bytes().to_vec(),
    }
}

/// Lamp command for a single cube.
pub fn lamp_command(cube: &CubeAddress, color: LampColor) -> Outbound {
    Outbound {
        topic: format!("{cube}/{LAMP_SUFFIX}"),
        payload: color.to_payload(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_command_is_addressed_to_bridge() {
        let cmd = assign_command(&ClientId::new("bridge-1"), &CubeAddress::new("aa:bb"));
        assert_eq!(cmd.topic, "bridge-1/connect");
        assert_eq!(cmd.payload, b"aa:bb".to_vec());
    }

    #[test]
    fn lamp_command_is_addressed_to_cube() {
        let cmd = lamp_command(&CubeAddress::new("c1"), LampColor::new(1, 2, 3));
        assert_eq!(cmd.topic, "c1/lamp");
        assert_eq!(cmd.payload, vec![1, 2, 3]);
    }
}
