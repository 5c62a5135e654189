//! Packet model, packetizer and wire codec.
//!
//! An image payload is split into an ordered batch of packets, each sent on
//! the bus as:
//! - a 2-byte big-endian length prefix
//! - a UTF-8 JSON record `{owner_id, packet_index, data}` with base64 data
//!
//! The batch ends with a terminal marker. Reads are bounded: a declared
//! length above the configured maximum is rejected before the body is
//! clocked.

pub mod codec;
pub mod command;
pub mod error;
pub mod packet;
pub mod packetizer;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_record, encode_packet, max_chunk_for, PacketRecord, DEFAULT_MAX_PACKET_LEN,
    LENGTH_PREFIX_SIZE,
};
pub use command::Command;
pub use error::{FrameError, Result};
pub use packet::{DeviceId, Packet, PacketBatch};
pub use packetizer::{encode, DEFAULT_MAX_CHUNK_SIZE, MAX_BATCH_PACKETS};
pub use reader::{PacketRead, PacketReader, ReaderConfig, DEFAULT_MAX_TRANSFER};
pub use writer::ResponseWriter;
