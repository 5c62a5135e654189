use buscap_transport::TransportError;

use crate::codec::{
    check_length, decode_record, parse_length, DEFAULT_MAX_PACKET_LEN, LENGTH_PREFIX_SIZE,
};
use crate::error::{FrameError, Result};
use crate::packet::Packet;

/// Default per-exchange limit when clocking a record body.
pub const DEFAULT_MAX_TRANSFER: usize = 64;

/// Configuration for length-prefixed packet reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Largest declared record length accepted. Default: 10000 bytes.
    pub max_packet_len: usize,
    /// Largest single exchange used while reading a body. Default: 64 bytes.
    pub max_transfer: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            max_transfer: DEFAULT_MAX_TRANSFER,
        }
    }
}

/// Outcome of one length-prefixed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketRead {
    /// A decoded packet record.
    Packet(Packet),
    /// The length prefix was zero; nothing followed.
    Empty,
}

/// Reads length-prefixed packet records through a clocking function.
///
/// The clock is called with a byte count and must return exactly that many
/// bytes clocked in from the device. Bodies are read in exchanges of at most
/// `max_transfer` bytes; an out-of-bounds length stops the read before any
/// body bytes are clocked.
#[derive(Debug, Clone, Default)]
pub struct PacketReader {
    config: ReaderConfig,
}

impl PacketReader {
    pub fn new(config: ReaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Read the next record.
    pub fn read<F>(&self, mut clock: F) -> Result<PacketRead>
    where
        F: FnMut(usize) -> std::result::Result<Vec<u8>, TransportError>,
    {
        let prefix = clock_exact(&mut clock, LENGTH_PREFIX_SIZE)?;
        let declared = parse_length([prefix[0], prefix[1]]);
        if declared == 0 {
            return Ok(PacketRead::Empty);
        }
        check_length(declared, self.config.max_packet_len)?;

        let step = self.config.max_transfer.max(1);
        let mut body = Vec::with_capacity(declared);
        while body.len() < declared {
            let n = (declared - body.len()).min(step);
            body.extend_from_slice(&clock_exact(&mut clock, n)?);
        }
        tracing::trace!(declared, "packet body clocked in");

        decode_record(&body).map(PacketRead::Packet)
    }
}

fn clock_exact<F>(clock: &mut F, n: usize) -> Result<Vec<u8>>
where
    F: FnMut(usize) -> std::result::Result<Vec<u8>, TransportError>,
{
    let bytes = clock(n)?;
    if bytes.len() != n {
        return Err(FrameError::ShortRead {
            expected: n,
            got: bytes.len(),
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};

    use super::*;
    use crate::codec::encode_packet;

    /// Clocks bytes out of a fixed buffer, recording each exchange size.
    struct Wire {
        bytes: Vec<u8>,
        pos: usize,
        exchanges: Vec<usize>,
    }

    impl Wire {
        fn new(bytes: Vec<u8>) -> Self {
            Self {
                bytes,
                pos: 0,
                exchanges: Vec::new(),
            }
        }

        fn clock(&mut self, n: usize) -> std::result::Result<Vec<u8>, TransportError> {
            self.exchanges.push(n);
            let mut out = vec![0u8; n];
            let available = self.bytes.len().saturating_sub(self.pos).min(n);
            out[..available].copy_from_slice(&self.bytes[self.pos..self.pos + available]);
            self.pos += n;
            Ok(out)
        }
    }

    fn wire_for(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_packet(packet, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn reads_body_in_bounded_exchanges() {
        let packet = Packet::data(1, 0, vec![0xAB; 100]);
        let bytes = wire_for(&packet);
        let body_len = bytes.len() - LENGTH_PREFIX_SIZE;
        let mut wire = Wire::new(bytes);

        let reader = PacketReader::default();
        let read = reader.read(|n| wire.clock(n)).unwrap();

        assert_eq!(read, PacketRead::Packet(packet));
        assert_eq!(wire.exchanges[0], LENGTH_PREFIX_SIZE);
        assert!(wire.exchanges[1..].iter().all(|&n| n <= DEFAULT_MAX_TRANSFER));
        assert_eq!(wire.exchanges[1..].iter().sum::<usize>(), body_len);
    }

    #[test]
    fn oversized_length_stops_before_body() {
        let mut buf = BytesMut::new();
        buf.put_u16(20_000);
        let mut wire = Wire::new(buf.to_vec());

        let err = PacketReader::default().read(|n| wire.clock(n)).unwrap_err();
        assert!(matches!(
            err,
            FrameError::LengthOutOfBounds {
                declared: 20_000,
                ..
            }
        ));
        assert!(err.is_corrupt());
        assert_eq!(wire.exchanges, vec![LENGTH_PREFIX_SIZE]);
    }

    #[test]
    fn zero_length_is_reported_as_empty() {
        let mut wire = Wire::new(vec![0, 0]);
        let read = PacketReader::default().read(|n| wire.clock(n)).unwrap();
        assert_eq!(read, PacketRead::Empty);
    }

    #[test]
    fn garbage_body_is_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        buf.put_slice(b"nope");
        let mut wire = Wire::new(buf.to_vec());

        let err = PacketReader::default().read(|n| wire.clock(n)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn custom_bound_and_transfer_size() {
        let packet = Packet::data(2, 7, Bytes::from_static(b"abcdef"));
        let bytes = wire_for(&packet);
        let mut wire = Wire::new(bytes);

        let reader = PacketReader::new(ReaderConfig {
            max_packet_len: 256,
            max_transfer: 8,
        });
        reader.read(|n| wire.clock(n)).unwrap();
        assert!(wire.exchanges[1..].iter().all(|&n| n <= 8));

        let tight = PacketReader::new(ReaderConfig {
            max_packet_len: 8,
            max_transfer: 8,
        });
        let mut wire = Wire::new(wire_for(&packet));
        assert!(tight.read(|n| wire.clock(n)).is_err());
    }

    #[test]
    fn transport_failure_surfaces() {
        let err = PacketReader::default()
            .read(|_| Err(TransportError::Shutdown))
            .unwrap_err();
        assert!(matches!(err, FrameError::Transport(TransportError::Shutdown)));
        assert!(!err.is_corrupt());
    }

    #[test]
    fn short_clock_is_rejected() {
        let err = PacketReader::default().read(|_| Ok(vec![0])).unwrap_err();
        assert!(matches!(
            err,
            FrameError::ShortRead {
                expected: 2,
                got: 1
            }
        ));
    }
}
