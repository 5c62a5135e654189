use std::collections::BTreeMap;

use buscap_frame::DeviceId;
use buscap_transport::BusAddress;
use serde::{Deserialize, Serialize};

/// Known peripherals and where they sit on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<DeviceEntry>", into = "Vec<DeviceEntry>")]
pub struct DeviceMap {
    entries: BTreeMap<DeviceId, BusAddress>,
}

/// Serialized form of one device map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub channel: u8,
    pub select: u8,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Add or move a device. Returns its previous address, if any.
    pub fn insert(&mut self, id: DeviceId, address: BusAddress) -> Option<BusAddress> {
        self.entries.insert(id, address)
    }

    pub fn with_device(mut self, id: DeviceId, address: BusAddress) -> Self {
        self.insert(id, address);
        self
    }

    pub fn address(&self, id: DeviceId) -> Option<BusAddress> {
        self.entries.get(&id).copied()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Known device ids in ascending order.
    pub fn ids(&self) -> Vec<DeviceId> {
        self.entries.keys().copied().collect()
    }

    /// Every known bus address.
    pub fn addresses(&self) -> Vec<BusAddress> {
        self.entries.values().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, BusAddress)> + '_ {
        self.entries.iter().map(|(id, addr)| (*id, *addr))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DeviceMap {
    /// Five peripherals across two bus channels.
    fn default() -> Self {
        Self::new()
            .with_device(1, BusAddress::new(0, 0))
            .with_device(2, BusAddress::new(0, 1))
            .with_device(3, BusAddress::new(1, 0))
            .with_device(4, BusAddress::new(1, 1))
            .with_device(5, BusAddress::new(1, 2))
    }
}

impl From<Vec<DeviceEntry>> for DeviceMap {
    fn from(entries: Vec<DeviceEntry>) -> Self {
        entries.into_iter().fold(Self::new(), |map, entry| {
            map.with_device(entry.id, BusAddress::new(entry.channel, entry.select))
        })
    }
}

impl From<DeviceMap> for Vec<DeviceEntry> {
    fn from(map: DeviceMap) -> Self {
        map.iter()
            .map(|(id, addr)| DeviceEntry {
                id,
                channel: addr.channel,
                select: addr.select,
            })
            .collect()
    }
}
