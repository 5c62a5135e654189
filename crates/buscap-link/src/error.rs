use std::path::PathBuf;
use std::time::Duration;

use buscap_frame::DeviceId;

use crate::trigger::TriggerMode;

/// Errors that can occur while coordinating a capture round.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The requested device selection is empty or names no known device.
    #[error("invalid device selection: {0}")]
    InvalidSelection(String),

    /// The configuration cannot work as a whole.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested trigger needs a topology this coordinator was not built with.
    #[error("{0} trigger is not available on this coordinator")]
    UnsupportedTrigger(TriggerMode),

    /// No trigger edge or addressed command arrived in time.
    #[error("no trigger within {0:?}")]
    NoTrigger(Duration),

    /// The camera failed to produce an image.
    #[error("capture failed: {0}")]
    CaptureFailure(String),

    /// An addressed capture command was not acknowledged.
    #[error("device {device} did not acknowledge capture (reply {reply:#04x})")]
    NoAck { device: DeviceId, reply: u8 },

    /// Every packet-count attempt yielded zero or failed.
    #[error("device {device} reported no data after {attempts} attempts")]
    NoData { device: DeviceId, attempts: u32 },

    /// A packet read returned something that is not a valid record.
    #[error("corrupt packet from device {device} at index {index}: {reason}")]
    CorruptPacket {
        device: DeviceId,
        index: u16,
        reason: String,
    },

    /// The bus failed.
    #[error("transport fault: {0}")]
    TransportFault(#[from] buscap_transport::TransportError),

    /// The round was interrupted.
    #[error("capture round cancelled")]
    Cancelled,

    /// A batch carried no image data.
    #[error("device {0} produced no image")]
    NoImage(DeviceId),

    /// Persisting an artifact failed.
    #[error("failed to write artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Packetizing a payload failed.
    #[error("frame error: {0}")]
    Frame(#[from] buscap_frame::FrameError),
}

pub type Result<T> = std::result::Result<T, LinkError>;
