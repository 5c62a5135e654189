use bytes::Bytes;

use crate::error::{FrameError, Result};
use crate::packet::{DeviceId, Packet, PacketBatch};

/// Default chunk size: 1 KiB of image data per packet.
///
/// Base64 plus the JSON record keep the encoded packet well under
/// [`crate::codec::DEFAULT_MAX_PACKET_LEN`]. Larger chunks must stay within
/// [`crate::codec::max_chunk_for`] of the reader's bound or every packet
/// reads as corrupt.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1024;

/// Packets per batch, terminal marker included. Bounded by the 16-bit count.
pub const MAX_BATCH_PACKETS: usize = u16::MAX as usize;

/// Split `payload` into an ordered batch for `owner_id`.
///
/// Produces `ceil(len / max_chunk_size)` data packets indexed from 0,
/// followed by one terminal marker. An empty payload yields the terminal
/// marker only. Chunks are zero-copy slices of `payload`.
pub fn encode(payload: Bytes, owner_id: DeviceId, max_chunk_size: usize) -> Result<PacketBatch> {
    if max_chunk_size == 0 {
        return Err(FrameError::InvalidChunkSize);
    }

    let real = payload.len().div_ceil(max_chunk_size);
    if real + 1 > MAX_BATCH_PACKETS {
        return Err(FrameError::TooManyPackets {
            packets: real + 1,
            max: MAX_BATCH_PACKETS,
        });
    }

    let mut batch = PacketBatch::with_capacity(owner_id, real + 1);
    for index in 0..real {
        let start = index * max_chunk_size;
        let end = (start + max_chunk_size).min(payload.len());
        // Bounded by MAX_BATCH_PACKETS above.
        batch.push(Packet::data(owner_id, index as u16, payload.slice(start..end)));
    }
    batch.push(Packet::terminal(owner_id, real as u16));

    tracing::debug!(
        owner = owner_id,
        bytes = payload.len(),
        packets = real,
        "payload packetized"
    );
    Ok(batch)
}
