//! Per-cube telemetry handling shared by the broker role (through a
//! [`BridgeSession`](crate::session::BridgeSession)) and the client role
//! (directly, from the reconnect agent).

use cubelink_middleware::topic;
use cubelink_types::{ClientId, CubeAddress, CubeError, CubeEvent, FleetEvent, LampColor};
use tracing::{debug, warn};

use crate::directory::CubeDirectory;
use crate::lamp::LampCycle;
use crate::notify::FleetNotifier;
use crate::protocol::{Outbound, lamp_command};

/// Parse `"<address>/<event>"`.
///
/// # Errors
///
/// [`CubeError::MalformedMessage`] when the topic is not a two-level device
/// topic or the event segment is unknown.
pub fn parse_device_topic(topic: &str) -> Result<(CubeAddress, CubeEvent), CubeError> {
    let (address, segment) = topic::split_device_topic(topic).ok_or_else(|| CubeError::MalformedMessage {
        topic: topic.to_string(),
        reason: "expected <address>/<event>".to_string(),
    })?;
    let event = CubeEvent::from_segment(segment).ok_or_else(|| CubeError::MalformedMessage {
        topic: topic.to_string(),
        reason: format!("unknown event '{segment}'"),
    })?;
    Ok((CubeAddress::new(address), event))
}

/// Mutable view over the shared cube state a telemetry event may touch.
pub struct CubeContext<'a> {
    pub directory: &'a mut CubeDirectory,
    pub lamp: &'a mut LampCycle,
    pub notifier: &'a FleetNotifier,
}

impl CubeContext<'_> {
    /// Light every connected cube with `color`.  Emits exactly one
    /// [`FleetEvent::LampChanged`] and returns one lamp command per cube.
    pub fn broadcast_lamp(&mut self, color: LampColor) -> Vec<Outbound> {
        let cubes = self.directory.set_lamp(color);
        debug!(%color, cubes = cubes.len(), "lamp broadcast");
        let commands = cubes.iter().map(|cube| lamp_command(cube, color)).collect();
        self.notifier.notify(FleetEvent::LampChanged { color, cubes });
        commands
    }

    /// Apply one telemetry event for `address`.
    ///
    /// `owner` is the reporting bridge in the broker role and `None` in the
    /// client role.  Returns the lamp commands the event produced.
    pub fn apply(
        &mut self,
        owner: Option<&ClientId>,
        address: &CubeAddress,
        event: CubeEvent,
        payload: &[u8],
    ) -> Result<Vec<Outbound>, CubeError> {
        match event {
            CubeEvent::Connected => {
                let record = self.directory.create_or_update(address);
                if let Some(owner) = owner {
                    record.owner = Some(owner.clone());
                }
                record.connected = true;
                record.lamp = Some(LampColor::WHITE);
                self.notifier.notify(FleetEvent::CubeConnected {
                    bridge: owner.cloned(),
                    cube: address.clone(),
                });
                Ok(vec![lamp_command(address, LampColor::WHITE)])
            }

            CubeEvent::Disconnected => {
                let Some(record) = self.directory.get_mut(address) else {
                    debug!(cube = %address, "disconnect for unknown cube ignored");
                    return Ok(Vec::new());
                };
                match (owner, record.owner.as_ref()) {
                    (Some(reporter), Some(current)) if reporter != current => {
                        debug!(cube = %address, reporter = %reporter, owner = %current, "disconnect from non-owning bridge ignored");
                        return Ok(Vec::new());
                    }
                    _ => {}
                }
                record.connected = false;
                if owner.is_some() {
                    record.owner = None;
                }
                self.notifier.notify(FleetEvent::CubeDisconnected { cube: address.clone() });
                Ok(Vec::new())
            }

            CubeEvent::Button => {
                let pressed = first_byte(address, event, payload)? != 0;
                if !pressed {
                    return Ok(Vec::new());
                }
                let color = self.lamp.next_color();
                Ok(self.broadcast_lamp(color))
            }

            CubeEvent::Battery => {
                let level = first_byte(address, event, payload)?;
                if self.directory.set_battery(address, level) {
                    self.notifier.notify(FleetEvent::BatteryChanged {
                        cube: address.clone(),
                        level,
                    });
                } else {
                    warn!(cube = %address, level, "battery reading for unknown cube dropped");
                }
                Ok(Vec::new())
            }
        }
    }
}

fn first_byte(address: &CubeAddress, event: CubeEvent, payload: &[u8]) -> Result<u8, CubeError> {
    payload.first().copied().ok_or_else(|| CubeError::MalformedMessage {
        topic: format!("{address}/{event}"),
        reason: "empty payload".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubelink_types::FleetNotice;
    use tokio::sync::broadcast;

    struct Fixture {
        directory: CubeDirectory,
        lamp: LampCycle,
        notifier: FleetNotifier,
        rx: broadcast::Receiver<FleetNotice>,
    }

    impl Fixture {
        fn new() -> Self {
            let notifier = FleetNotifier::new(64);
            let rx = notifier.subscribe();
            Self {
                directory: CubeDirectory::new(),
                lamp: LampCycle::new(),
                notifier,
                rx,
            }
        }

        fn ctx(&mut self) -> CubeContext<'_> {
            CubeContext {
                directory: &mut self.directory,
                lamp: &mut self.lamp,
                notifier: &self.notifier,
            }
        }

        fn drain(&mut self) -> Vec<FleetEvent> {
            let mut out = Vec::new();
            while let Ok(notice) = self.rx.try_recv() {
                out.push(notice.event);
            }
            out
        }
    }

    fn addr(s: &str) -> CubeAddress {
        CubeAddress::new(s)
    }

    #[test]
    fn parse_device_topic_variants() {
        assert_eq!(parse_device_topic("c1/battery").unwrap(), (addr("c1"), CubeEvent::Battery));
        assert!(parse_device_topic("c1/explode").is_err());
        assert!(parse_device_topic("status").is_err());
    }

    #[test]
    fn connected_sets_owner_and_white_lamp() {
        let mut fx = Fixture::new();
        let bridge = ClientId::new("b1");
        let out = fx.ctx().apply(Some(&bridge), &addr("c1"), CubeEvent::Connected, &[]).unwrap();

        assert_eq!(out, vec![lamp_command(&addr("c1"), LampColor::WHITE)]);
        let record = fx.directory.get(&addr("c1")).unwrap();
        assert!(record.connected);
        assert_eq!(record.owner, Some(bridge));
        assert_eq!(record.lamp, Some(LampColor::WHITE));
    }

    #[test]
    fn disconnected_keeps_prior_telemetry() {
        let mut fx = Fixture::new();
        let bridge = ClientId::new("b1");
        fx.ctx().apply(Some(&bridge), &addr("c1"), CubeEvent::Connected, &[]).unwrap();
        fx.ctx().apply(Some(&bridge), &addr("c1"), CubeEvent::Battery, &[64]).unwrap();

        fx.ctx().apply(Some(&bridge), &addr("c1"), CubeEvent::Disconnected, &[]).unwrap();
        let record = fx.directory.get(&addr("c1")).unwrap();
        assert!(!record.connected);
        assert_eq!(record.owner, None);
        assert_eq!(record.battery, Some(64));
        assert_eq!(record.lamp, Some(LampColor::WHITE));
    }

    #[test]
    fn disconnect_from_other_bridge_is_ignored() {
        let mut fx = Fixture::new();
        let b1 = ClientId::new("b1");
        let b2 = ClientId::new("b2");
        fx.ctx().apply(Some(&b1), &addr("c1"), CubeEvent::Connected, &[]).unwrap();
        fx.ctx().apply(Some(&b2), &addr("c1"), CubeEvent::Disconnected, &[]).unwrap();

        let record = fx.directory.get(&addr("c1")).unwrap();
        assert!(record.connected);
        assert_eq!(record.owner, Some(b1));
    }

    #[test]
    fn button_press_broadcasts_exactly_once() {
        let mut fx = Fixture::new();
        fx.ctx().apply(None, &addr("c1"), CubeEvent::Connected, &[]).unwrap();
        fx.ctx().apply(None, &addr("c2"), CubeEvent::Connected, &[]).unwrap();
        fx.drain();

        let out = fx.ctx().apply(None, &addr("c1"), CubeEvent::Button, &[0x01]).unwrap();
        assert_eq!(out.len(), 2);
        let lamp_events = fx
            .drain()
            .into_iter()
            .filter(|e| matches!(e, FleetEvent::LampChanged { .. }))
            .count();
        assert_eq!(lamp_events, 1);

        let out = fx.ctx().apply(None, &addr("c1"), CubeEvent::Button, &[0x00]).unwrap();
        assert!(out.is_empty());
        assert!(fx.drain().is_empty());
    }

    #[test]
    fn empty_payload_is_malformed() {
        let mut fx = Fixture::new();
        fx.ctx().apply(None, &addr("c1"), CubeEvent::Connected, &[]).unwrap();
        let err = fx.ctx().apply(None, &addr("c1"), CubeEvent::Battery, &[]).unwrap_err();
        assert!(matches!(err, CubeError::MalformedMessage { .. }));
        let err = fx.ctx().apply(None, &addr("c1"), CubeEvent::Button, &[]).unwrap_err();
        assert!(matches!(err, CubeError::MalformedMessage { .. }));
    }

    #[test]
    fn battery_for_unknown_cube_creates_nothing() {
        let mut fx = Fixture::new();
        fx.ctx().apply(None, &addr("ghost"), CubeEvent::Battery, &[10]).unwrap();
        assert!(fx.directory.is_empty());
        assert!(fx.drain().is_empty());
    }
}
