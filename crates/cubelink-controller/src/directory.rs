//! [`CubeDirectory`] – every cube the controller has ever seen.
//!
//! Entries are keyed by address and are never evicted: a cube that
//! disconnects keeps its last lamp and battery readings until it is
//! re-announced.

use std::collections::HashMap;

use cubelink_types::{ClientId, CubeAddress, LampColor};

/// Last-observed state of one cube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeRecord {
    pub address: CubeAddress,
    /// Bridge the cube is routed through; `None` while pending assignment.
    pub owner: Option<ClientId>,
    pub lamp: Option<LampColor>,
    pub battery: Option<u8>,
    pub connected: bool,
}

impl CubeRecord {
    fn new(address: CubeAddress) -> Self {
        Self {
            address,
            owner: None,
            lamp: None,
            battery: None,
            connected: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct CubeDirectory {
    cubes: HashMap<CubeAddress, CubeRecord>,
}

impl CubeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `address`, creating an empty unowned one if the
    /// cube is new.
    pub fn create_or_update(&mut self, address: &CubeAddress) -> &mut CubeRecord {
        self.cubes
            .entry(address.clone())
            .or_insert_with(|| CubeRecord::new(address.clone()))
    }

    pub fn get(&self, address: &CubeAddress) -> Option<&CubeRecord> {
        self.cubes.get(address)
    }

    pub fn get_mut(&mut self, address: &CubeAddress) -> Option<&mut CubeRecord> {
        self.cubes.get_mut(address)
    }

    pub fn contains(&self, address: &CubeAddress) -> bool {
        self.cubes.contains_key(address)
    }

    pub fn owner(&self, address: &CubeAddress) -> Option<&ClientId> {
        self.cubes.get(address).and_then(|c| c.owner.as_ref())
    }

    /// Apply `color` to every connected cube.  Returns the affected
    /// addresses in sorted order.
    pub fn set_lamp(&mut self, color: LampColor) -> Vec<CubeAddress> {
        let mut lit: Vec<CubeAddress> = self
            .cubes
            .values_mut()
            .filter(|c| c.connected)
            .map(|c| {
                c.lamp = Some(color);
                c.address.clone()
            })
            .collect();
        lit.sort();
        lit
    }

    /// Record a battery reading.  Returns `false` for unknown cubes.
    pub fn set_battery(&mut self, address: &CubeAddress, value: u8) -> bool {
        match self.cubes.get_mut(address) {
            Some(cube) => {
                cube.battery = Some(value);
                true
            }
            None => false,
        }
    }

    /// Clear ownership of every cube owned by `bridge` and mark them
    /// disconnected.  Returns the released addresses in sorted order.
    pub fn release_owned_by(&mut self, bridge: &ClientId) -> Vec<CubeAddress> {
        let mut released: Vec<CubeAddress> = self
            .cubes
            .values_mut()
            .filter(|c| c.owner.as_ref() == Some(bridge))
            .map(|c| {
                c.owner = None;
                c.connected = false;
                c.address.clone()
            })
            .collect();
        released.sort();
        released
    }

    /// Every cube currently flagged connected, sorted by address.
    pub fn connected(&self) -> Vec<&CubeRecord> {
        let mut cubes: Vec<&CubeRecord> = self.cubes.values().filter(|c| c.connected).collect();
        cubes.sort_by(|a, b| a.address.cmp(&b.address));
        cubes
    }

    pub fn len(&self) -> usize {
        self.cubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cubes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> CubeAddress {
        CubeAddress::new(s)
    }

    #[test]
    fn create_or_update_is_idempotent() {
        let mut dir = CubeDirectory::new();
        dir.create_or_update(&addr("c1")).battery = Some(50);
        let again = dir.create_or_update(&addr("c1"));
        assert_eq!(again.battery, Some(50));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn set_lamp_only_touches_connected_cubes() {
        let mut dir = CubeDirectory::new();
        dir.create_or_update(&addr("c2")).connected = true;
        dir.create_or_update(&addr("c1")).connected = true;
        dir.create_or_update(&addr("c3"));

        let red = LampColor::new(255, 0, 0);
        assert_eq!(dir.set_lamp(red), vec![addr("c1"), addr("c2")]);
        assert_eq!(dir.get(&addr("c1")).unwrap().lamp, Some(red));
        assert_eq!(dir.get(&addr("c3")).unwrap().lamp, None);
    }

    #[test]
    fn set_battery_ignores_unknown_cube() {
        let mut dir = CubeDirectory::new();
        assert!(!dir.set_battery(&addr("ghost"), 10));
        assert!(dir.is_empty());

        dir.create_or_update(&addr("c1"));
        assert!(dir.set_battery(&addr("c1"), 10));
        assert_eq!(dir.get(&addr("c1")).unwrap().battery, Some(10));
    }

    #[test]
    fn release_keeps_entries_and_telemetry() {
        let mut dir = CubeDirectory::new();
        let bridge = ClientId::new("b1");
        let other = ClientId::new("b2");
        {
            let c1 = dir.create_or_update(&addr("c1"));
            c1.owner = Some(bridge.clone());
            c1.connected = true;
            c1.battery = Some(90);
        }
        dir.create_or_update(&addr("c2")).owner = Some(other.clone());

        assert_eq!(dir.release_owned_by(&bridge), vec![addr("c1")]);
        let c1 = dir.get(&addr("c1")).unwrap();
        assert_eq!(c1.owner, None);
        assert!(!c1.connected);
        assert_eq!(c1.battery, Some(90));
        assert_eq!(dir.owner(&addr("c2")), Some(&other));
    }
}
