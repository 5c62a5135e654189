use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::packet::{DeviceId, Packet};

/// Length prefix: 2 bytes, big-endian.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Default maximum accepted record length. Larger declared lengths are corrupt.
pub const DEFAULT_MAX_PACKET_LEN: usize = 10_000;

/// Largest record a 2-byte prefix can describe.
pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

/// JSON around the data of the widest possible data record.
const RECORD_OVERHEAD: usize = r#"{"owner_id":4294967295,"packet_index":65535,"data":""}"#.len();

/// Largest chunk size whose encoded records never exceed `max_packet_len`.
///
/// Base64 grows data by 4/3, so the default 10000-byte bound allows chunks
/// of up to 7458 bytes.
pub fn max_chunk_for(max_packet_len: usize) -> usize {
    max_packet_len.saturating_sub(RECORD_OVERHEAD) / 4 * 3
}

/// Text record carried after the length prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacketRecord {
    #[serde(alias = "id")]
    pub owner_id: DeviceId,
    pub packet_index: u16,
    /// Base64 (standard alphabet) chunk data.
    pub data: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub last: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<&Packet> for PacketRecord {
    fn from(packet: &Packet) -> Self {
        Self {
            owner_id: packet.owner_id,
            packet_index: packet.index,
            data: STANDARD.encode(&packet.chunk),
            last: packet.is_terminal,
        }
    }
}

impl TryFrom<PacketRecord> for Packet {
    type Error = FrameError;

    fn try_from(record: PacketRecord) -> Result<Self> {
        let chunk = STANDARD.decode(record.data.as_bytes())?;
        Ok(Self {
            owner_id: record.owner_id,
            index: record.packet_index,
            chunk: chunk.into(),
            is_terminal: record.last,
        })
    }
}

/// Encode a packet into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────────────────────────────────┐
/// │ Length (2B)  │ UTF-8 JSON record (Length bytes)             │
/// │ big-endian   │ {"owner_id":1,"packet_index":0,"data":"..."} │
/// └──────────────┴──────────────────────────────────────────────┘
/// ```
pub fn encode_packet(packet: &Packet, dst: &mut BytesMut) -> Result<()> {
    let body = serde_json::to_vec(&PacketRecord::from(packet))?;
    if body.len() > MAX_RECORD_LEN {
        return Err(FrameError::RecordTooLarge {
            size: body.len(),
            max: MAX_RECORD_LEN,
        });
    }
    dst.reserve(LENGTH_PREFIX_SIZE + body.len());
    dst.put_u16(body.len() as u16);
    dst.put_slice(&body);
    Ok(())
}

/// Decode a record body (the bytes after the length prefix).
pub fn decode_record(body: &[u8]) -> Result<Packet> {
    let record: PacketRecord = serde_json::from_slice(body)?;
    Packet::try_from(record)
}

/// Parse a length prefix.
pub fn parse_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> usize {
    u16::from_be_bytes(prefix) as usize
}

/// Reject declared lengths above `max`.
pub fn check_length(declared: usize, max: usize) -> Result<()> {
    if declared > max {
        return Err(FrameError::LengthOutOfBounds { declared, max });
    }
    Ok(())
}
