use bytes::Bytes;

/// Identity of a peripheral. Unique per device on one coordinator.
pub type DeviceId = u32;

/// Smallest unit of transferred image data.
///
/// Identified by `(owner_id, index)`. A terminal packet carries no data and
/// marks the end of its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub owner_id: DeviceId,
    pub index: u16,
    pub chunk: Bytes,
    pub is_terminal: bool,
}

impl Packet {
    /// A packet carrying one chunk of image data.
    pub fn data(owner_id: DeviceId, index: u16, chunk: impl Into<Bytes>) -> Self {
        Self {
            owner_id,
            index,
            chunk: chunk.into(),
            is_terminal: false,
        }
    }

    /// The end-of-batch marker.
    pub fn terminal(owner_id: DeviceId, index: u16) -> Self {
        Self {
            owner_id,
            index,
            chunk: Bytes::new(),
            is_terminal: true,
        }
    }
}

/// Ordered packets for one owner from one capture cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBatch {
    owner_id: DeviceId,
    packets: Vec<Packet>,
}

impl PacketBatch {
    pub fn new(owner_id: DeviceId) -> Self {
        Self {
            owner_id,
            packets: Vec::new(),
        }
    }

    pub fn with_capacity(owner_id: DeviceId, capacity: usize) -> Self {
        Self {
            owner_id,
            packets: Vec::with_capacity(capacity),
        }
    }

    pub fn owner_id(&self) -> DeviceId {
        self.owner_id
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    /// All packets, terminal marker included.
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Packets carrying image data.
    pub fn real_packets(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter().filter(|p| !p.is_terminal)
    }

    /// Number of packets carrying image data.
    pub fn real_len(&self) -> usize {
        self.real_packets().count()
    }

    /// Number of packets including the terminal marker.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True when the batch holds no image data.
    pub fn is_empty(&self) -> bool {
        self.real_len() == 0
    }

    /// True once a terminal marker has been appended.
    pub fn is_terminated(&self) -> bool {
        self.packets.iter().any(|p| p.is_terminal)
    }

    /// Total image bytes carried by the batch.
    pub fn payload_len(&self) -> usize {
        self.real_packets().map(|p| p.chunk.len()).sum()
    }

    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_counts_exclude_terminal() {
        let mut batch = PacketBatch::new(4);
        batch.push(Packet::data(4, 0, vec![1, 2, 3]));
        batch.push(Packet::data(4, 1, vec![4]));
        assert!(!batch.is_terminated());
        batch.push(Packet::terminal(4, 2));

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.real_len(), 2);
        assert_eq!(batch.payload_len(), 4);
        assert!(batch.is_terminated());
        assert!(!batch.is_empty());
    }

    #[test]
    fn terminal_only_batch_is_empty() {
        let mut batch = PacketBatch::new(1);
        batch.push(Packet::terminal(1, 0));
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 1);
    }
}
