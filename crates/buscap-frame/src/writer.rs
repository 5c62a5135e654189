use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{encode_packet, LENGTH_PREFIX_SIZE};
use crate::error::Result;
use crate::packet::Packet;

const INITIAL_BUFFER_CAPACITY: usize = 2 * 1024;

/// Peripheral-side response queue.
///
/// Responses are staged here when a command arrives and clocked out by the
/// coordinator's following exchanges. Bytes past the staged response read
/// as zero, like an idle line.
#[derive(Debug)]
pub struct ResponseWriter {
    buf: BytesMut,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Bytes staged and not yet clocked out.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Stage a single status byte.
    pub fn push_byte(&mut self, byte: u8) {
        self.buf.put_u8(byte);
    }

    /// Stage a big-endian packet count.
    pub fn push_count(&mut self, count: u16) {
        self.buf.put_u16(count);
    }

    /// Stage a length-prefixed packet record.
    pub fn push_packet(&mut self, packet: &Packet) -> Result<()> {
        encode_packet(packet, &mut self.buf)
    }

    /// Stage a zero length prefix (nothing left to send).
    pub fn push_empty(&mut self) {
        self.buf.put_bytes(0, LENGTH_PREFIX_SIZE);
    }

    /// Clock out exactly `n` bytes, zero-padded past the staged response.
    pub fn clock_out(&mut self, n: usize) -> Vec<u8> {
        let available = self.buf.len().min(n);
        let mut out = Vec::with_capacity(n);
        out.extend_from_slice(&self.buf[..available]);
        self.buf.advance(available);
        out.resize(n, 0);
        out
    }

    /// Drop anything not yet clocked out. Returns the number of bytes dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_record;

    #[test]
    fn clocks_staged_bytes_then_zeros() {
        let mut writer = ResponseWriter::new();
        writer.push_count(0x0102);
        assert_eq!(writer.pending(), 2);

        assert_eq!(writer.clock_out(1), vec![0x01]);
        assert_eq!(writer.clock_out(3), vec![0x02, 0, 0]);
        assert!(writer.is_empty());
        assert_eq!(writer.clock_out(2), vec![0, 0]);
    }

    #[test]
    fn packet_is_length_prefixed() {
        let mut writer = ResponseWriter::new();
        let packet = Packet::data(5, 1, vec![9, 8, 7]);
        writer.push_packet(&packet).unwrap();

        let prefix = writer.clock_out(LENGTH_PREFIX_SIZE);
        let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
        assert_eq!(writer.pending(), len);

        let body = writer.clock_out(len);
        assert_eq!(decode_record(&body).unwrap(), packet);
    }

    #[test]
    fn clear_discards_partial_response() {
        let mut writer = ResponseWriter::new();
        writer.push_packet(&Packet::data(1, 0, vec![1; 32])).unwrap();
        writer.clock_out(4);

        assert!(writer.clear() > 0);
        assert!(writer.is_empty());
        assert_eq!(writer.clock_out(2), vec![0, 0]);
    }

    #[test]
    fn empty_marker_is_two_zero_bytes() {
        let mut writer = ResponseWriter::new();
        writer.push_empty();
        assert_eq!(writer.clock_out(2), vec![0, 0]);
    }
}
