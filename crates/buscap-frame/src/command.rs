//! Single-byte command protocol.
//!
//! A transaction is: select, one exchange carrying the command byte (reply
//! ignored), one or more response exchanges clocked with zero bytes,
//! deselect.

/// Start a capture (addressed trigger topology).
pub const CAPTURE: u8 = 0x01;

/// Report the pending packet count. Never consumes a packet.
pub const STATUS_OR_COUNT: u8 = 0x02;

/// Dequeue and send the next pending packet.
pub const REQUEST_PACKET: u8 = 0x03;

/// Positive acknowledgement for [`CAPTURE`].
pub const ACK: u8 = 0x01;

/// Negative acknowledgement. Also what an unresponsive line reads as.
pub const NAK: u8 = 0x00;

/// Reply to an unknown command byte.
pub const UNKNOWN_COMMAND: u8 = 0xFF;

/// Size of the [`CAPTURE`] response.
pub const ACK_SIZE: usize = 1;

/// Size of the [`STATUS_OR_COUNT`] response: big-endian u16.
pub const COUNT_SIZE: usize = 2;

/// Commands understood by a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Capture,
    StatusOrCount,
    RequestPacket,
}

impl Command {
    pub fn byte(self) -> u8 {
        match self {
            Command::Capture => CAPTURE,
            Command::StatusOrCount => STATUS_OR_COUNT,
            Command::RequestPacket => REQUEST_PACKET,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Capture => "capture",
            Command::StatusOrCount => "status",
            Command::RequestPacket => "request-packet",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            CAPTURE => Ok(Command::Capture),
            STATUS_OR_COUNT => Ok(Command::StatusOrCount),
            REQUEST_PACKET => Ok(Command::RequestPacket),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes_roundtrip() {
        for cmd in [
            Command::Capture,
            Command::StatusOrCount,
            Command::RequestPacket,
        ] {
            assert_eq!(Command::try_from(cmd.byte()), Ok(cmd));
        }
        assert_eq!(Command::try_from(0x00), Err(0x00));
        assert_eq!(Command::try_from(0x7F), Err(0x7F));
    }
}
