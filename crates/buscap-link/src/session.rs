use buscap_frame::command::{Command, COUNT_SIZE};
use buscap_frame::{DeviceId, FrameError, Packet, PacketBatch, PacketRead, PacketReader};
use buscap_transport::{BusAddress, BusTransport};
use tracing::{debug, info, warn};

use crate::arbiter::BusArbiter;
use crate::cancel::CancelFlag;
use crate::config::RetrievalConfig;
use crate::error::{LinkError, Result};

/// Why retrieval stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    NoData,
    Cancelled,
}

/// Retrieval progress for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    CountRequested,
    Receiving(u16),
    Complete,
    Aborted(AbortReason),
}

/// A packet index that could not be read.
#[derive(Debug)]
pub struct SkippedPacket {
    pub index: u16,
    pub error: LinkError,
}

/// Everything pulled from one device.
#[derive(Debug)]
pub struct Retrieval {
    /// Packets in the order they were received, terminal marker included.
    pub batch: PacketBatch,
    /// Count the device declared, terminal marker included.
    pub declared: u16,
    /// Indices that faulted and were skipped.
    pub skipped: Vec<SkippedPacket>,
}

/// Polls one device for its packet batch.
///
/// Every exchange goes through the arbiter and the cancel flag is checked
/// before each one. Packet reads are never retried: a request dequeues the
/// packet on the device whether or not it arrives intact.
pub struct TransportSession<'a, B: BusTransport> {
    arbiter: &'a mut BusArbiter<B>,
    device: DeviceId,
    address: BusAddress,
    config: RetrievalConfig,
    reader: PacketReader,
    cancel: CancelFlag,
    state: SessionState,
    declared: Option<u16>,
    received: usize,
}

impl<'a, B: BusTransport> TransportSession<'a, B> {
    pub fn new(
        arbiter: &'a mut BusArbiter<B>,
        device: DeviceId,
        address: BusAddress,
        config: RetrievalConfig,
        cancel: CancelFlag,
    ) -> Self {
        let reader = PacketReader::new(config.reader_config());
        Self {
            arbiter,
            device,
            address,
            config,
            reader,
            cancel,
            state: SessionState::Idle,
            declared: None,
            received: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn check_cancel(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.state = SessionState::Aborted(AbortReason::Cancelled);
            return Err(LinkError::Cancelled);
        }
        Ok(())
    }

    /// Ask the device how many packets it holds.
    ///
    /// Retried with a fixed backoff while the answer is zero or the exchange
    /// fails. Exhausting every attempt is [`LinkError::NoData`].
    pub fn get_packet_count(&mut self) -> Result<u16> {
        self.state = SessionState::CountRequested;
        let attempts = self.config.count_attempts.max(1);

        for attempt in 1..=attempts {
            self.check_cancel()?;
            match self.exchange_count() {
                Ok(0) => debug!(device = self.device, attempt, "device reports no packets"),
                Ok(count) => {
                    debug!(device = self.device, attempt, count, "packet count received");
                    self.declared = Some(count);
                    return Ok(count);
                }
                Err(err) => {
                    warn!(device = self.device, attempt, error = %err, "packet count failed")
                }
            }

            if attempt < attempts && !self.cancel.sleep(self.config.count_backoff()) {
                self.state = SessionState::Aborted(AbortReason::Cancelled);
                return Err(LinkError::Cancelled);
            }
        }

        self.state = SessionState::Aborted(AbortReason::NoData);
        Err(LinkError::NoData {
            device: self.device,
            attempts,
        })
    }

    fn exchange_count(&mut self) -> Result<u16> {
        let mut guard = self.arbiter.acquire(self.address)?;
        guard.send_command(Command::StatusOrCount)?;
        let rx = guard.clock_in(COUNT_SIZE)?;
        guard.release()?;
        Ok(u16::from_be_bytes([rx[0], rx[1]]))
    }

    /// Request and read the next packet, expected at `index`.
    pub fn get_packet(&mut self, index: u16) -> Result<Packet> {
        self.check_cancel()?;
        self.state = SessionState::Receiving(index);

        let mut guard = self.arbiter.acquire(self.address)?;
        guard.send_command(Command::RequestPacket)?;
        let read = self.reader.read(|n| guard.clock_in(n));
        guard.release()?;

        let corrupt = |reason: String| LinkError::CorruptPacket {
            device: self.device,
            index,
            reason,
        };

        match read {
            Ok(PacketRead::Packet(packet)) => {
                if packet.owner_id != self.device {
                    return Err(corrupt(format!(
                        "record belongs to device {}",
                        packet.owner_id
                    )));
                }
                if packet.index != index {
                    warn!(
                        device = self.device,
                        expected = index,
                        got = packet.index,
                        "packet index out of sequence"
                    );
                }
                self.received += 1;
                Ok(packet)
            }
            Ok(PacketRead::Empty) if self.empty_batch_terminal(index) => {
                self.received += 1;
                Ok(Packet::terminal(self.device, index))
            }
            Ok(PacketRead::Empty) => Err(corrupt(FrameError::ZeroLength.to_string())),
            Err(err) if err.is_corrupt() => Err(corrupt(err.to_string())),
            Err(FrameError::Transport(err)) => Err(LinkError::TransportFault(err)),
            Err(err) => Err(LinkError::Frame(err)),
        }
    }

    /// A zero-length read stands in for the terminal marker only as the first
    /// read of a batch declared as terminal-only.
    fn empty_batch_terminal(&self, index: u16) -> bool {
        self.config.zero_length_terminal
            && self.declared == Some(1)
            && index == 0
            && self.received == 0
    }

    /// Pull the whole batch in ascending index order.
    ///
    /// A faulted packet is recorded and skipped; retrieval continues with the
    /// next index. A terminal marker ends retrieval early.
    pub fn retrieve_all(&mut self) -> Result<Retrieval> {
        let declared = self.get_packet_count()?;
        let mut batch = PacketBatch::with_capacity(self.device, declared as usize);
        let mut skipped = Vec::new();

        for index in 0..declared {
            match self.get_packet(index) {
                Ok(packet) => {
                    let terminal = packet.is_terminal;
                    batch.push(packet);
                    if terminal {
                        break;
                    }
                }
                Err(LinkError::Cancelled) => return Err(LinkError::Cancelled),
                Err(error) => {
                    warn!(device = self.device, index, error = %error, "skipping packet");
                    skipped.push(SkippedPacket { index, error });
                }
            }
        }

        self.state = SessionState::Complete;
        info!(
            device = self.device,
            declared,
            received = batch.real_len(),
            skipped = skipped.len(),
            "retrieval complete"
        );
        Ok(Retrieval {
            batch,
            declared,
            skipped,
        })
    }
}
