use std::collections::BTreeMap;
use std::path::PathBuf;

use buscap_frame::{DeviceId, Packet, PacketBatch};
use bytes::{Bytes, BytesMut};
use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::config::ReassemblerConfig;
use crate::error::{LinkError, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Payload rebuilt from a batch, with what was wrong with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembly {
    pub payload: Bytes,
    /// Real packets used.
    pub packets: usize,
    /// Missing indices below the highest index seen.
    pub gaps: Vec<u16>,
    /// Indices received more than once. The first copy is kept.
    pub duplicates: Vec<u16>,
    /// Packets dropped because they belong to another device.
    pub foreign: usize,
}

/// Concatenate a batch's chunks in index order.
pub fn reassemble(batch: &PacketBatch) -> Reassembly {
    let owner = batch.owner_id();
    let mut ordered: BTreeMap<u16, &Packet> = BTreeMap::new();
    let mut duplicates = Vec::new();
    let mut foreign = 0;
    let mut terminal_at = None;

    for packet in batch.packets() {
        if packet.owner_id != owner {
            warn!(
                device = owner,
                owner = packet.owner_id,
                index = packet.index,
                "dropping packet from another device"
            );
            foreign += 1;
            continue;
        }
        if packet.is_terminal {
            terminal_at.get_or_insert(packet.index);
            continue;
        }
        if ordered.contains_key(&packet.index) {
            duplicates.push(packet.index);
        } else {
            ordered.insert(packet.index, packet);
        }
    }

    // The terminal marker sits right after the last real index.
    let expected_end = match (terminal_at, ordered.keys().next_back()) {
        (Some(end), Some(&last)) => end.max(last.saturating_add(1)),
        (Some(end), None) => end,
        (None, Some(&last)) => last.saturating_add(1),
        (None, None) => 0,
    };
    let gaps: Vec<u16> = (0..expected_end)
        .filter(|index| !ordered.contains_key(index))
        .collect();
    if !gaps.is_empty() {
        warn!(device = owner, ?gaps, "batch has gaps");
    }

    let size = ordered.values().map(|p| p.chunk.len()).sum();
    let mut payload = BytesMut::with_capacity(size);
    for packet in ordered.values() {
        payload.extend_from_slice(&packet.chunk);
    }

    Reassembly {
        payload: payload.freeze(),
        packets: ordered.len(),
        gaps,
        duplicates,
        foreign,
    }
}

/// A persisted capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub device: DeviceId,
    pub path: PathBuf,
    pub bytes: usize,
    pub packets: usize,
    pub gaps: Vec<u16>,
}

/// Writes reassembled batches to the output directory.
#[derive(Debug, Clone, Default)]
pub struct Reassembler {
    config: ReassemblerConfig,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    /// `<output_dir>/device-<id>_<YYYYmmddTHHMMSS>.<ext>`
    pub fn artifact_path(&self, device: DeviceId, session: &NaiveDateTime) -> PathBuf {
        let name = format!(
            "device-{device}_{}.{}",
            session.format(TIMESTAMP_FORMAT),
            self.config.extension
        );
        self.config.output_dir.join(name)
    }

    /// Rebuild and persist a batch. An empty batch is [`LinkError::NoImage`]
    /// and writes nothing.
    pub fn assemble(&self, batch: &PacketBatch, session: &NaiveDateTime) -> Result<Artifact> {
        let device = batch.owner_id();
        let reassembly = reassemble(batch);
        if reassembly.packets == 0 {
            return Err(LinkError::NoImage(device));
        }

        let path = self.artifact_path(device, session);
        let write = std::fs::create_dir_all(&self.config.output_dir)
            .and_then(|()| std::fs::write(&path, &reassembly.payload));
        if let Err(source) = write {
            return Err(LinkError::Artifact { path, source });
        }

        info!(
            device,
            path = %path.display(),
            bytes = reassembly.payload.len(),
            gaps = reassembly.gaps.len(),
            "artifact written"
        );
        Ok(Artifact {
            device,
            path,
            bytes: reassembly.payload.len(),
            packets: reassembly.packets,
            gaps: reassembly.gaps,
        })
    }
}
