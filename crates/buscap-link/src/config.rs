use std::path::PathBuf;
use std::time::Duration;

use buscap_frame::{
    max_chunk_for, ReaderConfig, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_PACKET_LEN,
    DEFAULT_MAX_TRANSFER,
};
use serde::{Deserialize, Serialize};

use crate::devices::DeviceMap;
use crate::error::{LinkError, Result};
use crate::trigger::TriggerMode;

/// Bus arbiter retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Attempts to select and open a device before giving up. Default: 3.
    pub open_attempts: u32,
    /// Pause between open attempts in milliseconds. Default: 50.
    pub open_backoff_ms: u64,
}

impl ArbiterConfig {
    pub fn open_backoff(&self) -> Duration {
        Duration::from_millis(self.open_backoff_ms)
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            open_backoff_ms: 50,
        }
    }
}

/// Packet retrieval behavior for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Packet-count attempts before reporting no data. Default: 5.
    pub count_attempts: u32,
    /// Fixed pause between count attempts in milliseconds. Default: 200.
    pub count_backoff_ms: u64,
    /// Largest accepted declared packet length. Default: 10000.
    pub max_packet_len: usize,
    /// Largest single exchange while reading a packet body. Default: 64.
    pub max_transfer: usize,
    /// Treat a zero length on the first read of an empty batch as the
    /// terminal marker. Any other zero-length read is corrupt. Default: true.
    pub zero_length_terminal: bool,
}

impl RetrievalConfig {
    pub fn count_backoff(&self) -> Duration {
        Duration::from_millis(self.count_backoff_ms)
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            max_packet_len: self.max_packet_len,
            max_transfer: self.max_transfer,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            count_attempts: 5,
            count_backoff_ms: 200,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            max_transfer: DEFAULT_MAX_TRANSFER,
            zero_length_terminal: true,
        }
    }
}

/// Trigger pulse and settle timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerTiming {
    /// Minimum time the broadcast line is held asserted. Default: 100 ms.
    pub pulse_width_ms: u64,
    /// Wait between triggering and the first retrieval. Default: 3000 ms.
    pub settle_ms: u64,
}

impl TriggerTiming {
    pub fn pulse_width(&self) -> Duration {
        Duration::from_millis(self.pulse_width_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for TriggerTiming {
    fn default() -> Self {
        Self {
            pulse_width_ms: 100,
            settle_ms: 3000,
        }
    }
}

/// Where and how artifacts are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblerConfig {
    /// Output directory. Created on first write. Default: `captures`.
    pub output_dir: PathBuf,
    /// Artifact file extension without the dot. Default: `jpg`.
    pub extension: String,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("captures"),
            extension: "jpg".to_string(),
        }
    }
}

/// Peripheral-side behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Largest image chunk per packet. Default: 1024.
    pub max_chunk_size: usize,
    /// How long to wait for a trigger before reporting none. Default: 30 s.
    pub trigger_timeout_ms: u64,
    /// Passed to the camera on every capture. Default: false.
    pub color_correction: bool,
}

impl PeripheralConfig {
    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            trigger_timeout_ms: 30_000,
            color_correction: false,
        }
    }
}

/// Everything a coordinator needs for a capture round.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub trigger_mode: TriggerMode,
    pub devices: DeviceMap,
    pub arbiter: ArbiterConfig,
    pub retrieval: RetrievalConfig,
    pub trigger: TriggerTiming,
    pub reassembler: ReassemblerConfig,
    pub peripheral: PeripheralConfig,
}

impl CoordinatorConfig {
    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Check that peripheral packets fit what the coordinator will accept.
    pub fn validate(&self) -> Result<()> {
        let chunk = self.peripheral.max_chunk_size;
        let limit = max_chunk_for(self.retrieval.max_packet_len);
        if chunk == 0 || chunk > limit {
            return Err(LinkError::InvalidConfig(format!(
                "max_chunk_size {chunk} must be between 1 and {limit} for max_packet_len {}",
                self.retrieval.max_packet_len
            )));
        }
        Ok(())
    }
}
