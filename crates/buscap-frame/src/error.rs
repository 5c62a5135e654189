/// Errors that can occur while packetizing, encoding or reading packets.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A zero chunk size can never make progress.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    /// The payload needs more packets than the 16-bit count can declare.
    #[error("payload needs {packets} packets (max {max})")]
    TooManyPackets { packets: usize, max: usize },

    /// The declared length prefix is outside the accepted bounds.
    #[error("declared packet length {declared} out of bounds (max {max})")]
    LengthOutOfBounds { declared: usize, max: usize },

    /// A zero-length read where a packet record was expected.
    #[error("zero-length packet")]
    ZeroLength,

    /// The encoded record exceeds what a 2-byte length prefix can carry.
    #[error("encoded record too large ({size} bytes, max {max})")]
    RecordTooLarge { size: usize, max: usize },

    /// The record body is not valid JSON for a packet record.
    #[error("packet record decode failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The record's data field is not valid base64.
    #[error("packet data decode failed: {0}")]
    Data(#[from] base64::DecodeError),

    /// An exchange returned fewer bytes than were clocked.
    #[error("short read ({got} of {expected} bytes)")]
    ShortRead { expected: usize, got: usize },

    /// The bus failed mid-read.
    #[error("transport error: {0}")]
    Transport(#[from] buscap_transport::TransportError),
}

impl FrameError {
    /// True for errors that describe a bad packet rather than a bad bus.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            FrameError::LengthOutOfBounds { .. }
                | FrameError::ZeroLength
                | FrameError::Json(_)
                | FrameError::Data(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
