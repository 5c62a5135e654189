//! Peripheral side of the protocol.
//!
//! A [`Peripheral`] owns a camera and a [`PeripheralSession`]. It waits for a
//! trigger (shared line or addressed command), captures, packetizes, and then
//! answers the coordinator's count and packet requests from its pending
//! queue.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use buscap_frame::command::{Command, ACK, NAK, UNKNOWN_COMMAND};
use buscap_frame::{packetizer, DeviceId, Packet, ResponseWriter};
use buscap_transport::{BusDevice, TransportError, TriggerInput};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::PeripheralConfig;
use crate::error::{LinkError, Result};

/// Options passed to the camera on each capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    pub color_correction: bool,
}

/// Source of image payloads.
pub trait Camera: Send {
    fn capture(&mut self, options: &CaptureOptions) -> std::io::Result<Bytes>;
}

impl<T: Camera + ?Sized> Camera for Box<T> {
    fn capture(&mut self, options: &CaptureOptions) -> std::io::Result<Bytes> {
        (**self).capture(options)
    }
}

/// Serves the current contents of an image file on every capture.
#[derive(Debug, Clone)]
pub struct FileCamera {
    path: PathBuf,
}

impl FileCamera {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Camera for FileCamera {
    fn capture(&mut self, _options: &CaptureOptions) -> std::io::Result<Bytes> {
        std::fs::read(&self.path).map(Bytes::from)
    }
}

/// Returns the same payload on every capture.
#[derive(Debug, Clone)]
pub struct StaticCamera {
    payload: Bytes,
}

impl StaticCamera {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

impl Camera for StaticCamera {
    fn capture(&mut self, _options: &CaptureOptions) -> std::io::Result<Bytes> {
        Ok(self.payload.clone())
    }
}

/// State owned by one peripheral's command handler.
#[derive(Debug)]
pub struct PeripheralSession {
    device: DeviceId,
    pending: VecDeque<Packet>,
    response: ResponseWriter,
    last_failure: Option<LinkError>,
    captures: u64,
}

impl PeripheralSession {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            pending: VecDeque::new(),
            response: ResponseWriter::new(),
            last_failure: None,
            captures: 0,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Packets waiting to be requested, terminal marker included.
    pub fn pending_count(&self) -> u16 {
        u16::try_from(self.pending.len()).unwrap_or(u16::MAX)
    }

    pub fn last_failure(&self) -> Option<&LinkError> {
        self.last_failure.as_ref()
    }

    /// Successful captures since creation.
    pub fn captures(&self) -> u64 {
        self.captures
    }

    fn load(&mut self, packets: Vec<Packet>) {
        self.pending = packets.into();
        self.last_failure = None;
        self.captures += 1;
    }

    fn fail(&mut self, error: LinkError) {
        self.pending.clear();
        self.last_failure = Some(error);
    }
}

/// A camera peripheral attached to the bus.
pub struct Peripheral<C: Camera> {
    camera: C,
    config: PeripheralConfig,
    session: PeripheralSession,
    selected: bool,
    expecting_command: bool,
}

impl<C: Camera> Peripheral<C> {
    pub fn new(device: DeviceId, camera: C, config: PeripheralConfig) -> Self {
        Self {
            camera,
            config,
            session: PeripheralSession::new(device),
            selected: false,
            expecting_command: false,
        }
    }

    pub fn session(&self) -> &PeripheralSession {
        &self.session
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    /// Capture and packetize. Returns the number of packets now pending.
    ///
    /// A failure leaves nothing pending, so the coordinator sees count 0.
    pub fn capture(&mut self) -> Result<u16> {
        let device = self.session.device;
        let options = CaptureOptions {
            color_correction: self.config.color_correction,
        };

        let payload = match self.camera.capture(&options) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(device, error = %err, "camera capture failed");
                self.session.fail(LinkError::CaptureFailure(err.to_string()));
                return Err(LinkError::CaptureFailure(err.to_string()));
            }
        };

        let bytes = payload.len();
        match packetizer::encode(payload, device, self.config.max_chunk_size) {
            Ok(batch) => {
                self.session.load(batch.into_packets());
                let packets = self.session.pending_count();
                info!(device, bytes, packets, "image captured");
                Ok(packets)
            }
            Err(err) => {
                warn!(device, error = %err, "packetizing failed");
                let reason = err.to_string();
                self.session.fail(LinkError::Frame(err));
                Err(LinkError::CaptureFailure(reason))
            }
        }
    }

    /// No trigger arrived within the timeout: drop pending state and go idle.
    pub fn no_trigger(&mut self) {
        let timeout = self.config.trigger_timeout();
        warn!(device = self.session.device, ?timeout, "no trigger received");
        self.session.response.clear();
        self.session.fail(LinkError::NoTrigger(timeout));
    }

    /// Block on the shared trigger line, then capture.
    pub fn await_trigger(&mut self, input: &mut impl TriggerInput) -> Result<u16> {
        let timeout = self.config.trigger_timeout();
        let edge = input.wait_for_edge(timeout)?;
        self.after_wait(edge)
    }

    fn after_wait(&mut self, edge: bool) -> Result<u16> {
        if edge {
            debug!(device = self.session.device, "trigger edge observed");
            self.capture()
        } else {
            self.no_trigger();
            Err(LinkError::NoTrigger(self.config.trigger_timeout()))
        }
    }

    fn handle_command(&mut self, byte: u8) {
        let device = self.session.device;
        let command = match Command::try_from(byte) {
            Ok(command) => command,
            Err(unknown) => {
                warn!(device, command = unknown, "unknown command");
                self.session.response.push_byte(UNKNOWN_COMMAND);
                return;
            }
        };
        debug!(device, command = command.name(), "command received");

        match command {
            Command::Capture => {
                let ack = if self.capture().is_ok() { ACK } else { NAK };
                self.session.response.push_byte(ack);
            }
            Command::StatusOrCount => {
                let count = self.session.pending_count();
                self.session.response.push_count(count);
            }
            Command::RequestPacket => match self.session.pending.pop_front() {
                Some(packet) => {
                    if let Err(err) = self.session.response.push_packet(&packet) {
                        warn!(device, index = packet.index, error = %err, "packet encode failed");
                        self.session.response.push_empty();
                    }
                }
                None => self.session.response.push_empty(),
            },
        }
    }
}

impl<C: Camera> BusDevice for Peripheral<C> {
    fn select(&mut self, asserted: bool) {
        self.selected = asserted;
        self.expecting_command = asserted;
        if !asserted {
            let dropped = self.session.response.clear();
            if dropped > 0 {
                debug!(
                    device = self.session.device,
                    dropped, "deselected with unsent response"
                );
            }
        }
    }

    fn exchange(&mut self, tx: &[u8]) -> Vec<u8> {
        if !self.selected {
            return vec![0; tx.len()];
        }
        if self.expecting_command {
            if let Some(&byte) = tx.first() {
                self.expecting_command = false;
                self.handle_command(byte);
            }
            return vec![0; tx.len()];
        }
        self.session.response.clock_out(tx.len())
    }

    fn idle(&mut self) {
        self.no_trigger();
    }
}

/// Wait for one trigger edge, then capture on a peripheral shared with a bus.
///
/// The wait happens without holding the lock so the bus can keep reaching
/// the device.
pub fn run_trigger_cycle<C, I>(peripheral: &Mutex<Peripheral<C>>, input: &mut I) -> Result<u16>
where
    C: Camera,
    I: TriggerInput + ?Sized,
{
    let timeout = lock(peripheral)?.config.trigger_timeout();
    let edge = input.wait_for_edge(timeout)?;
    lock(peripheral)?.after_wait(edge)
}

fn lock<C: Camera>(
    peripheral: &Mutex<Peripheral<C>>,
) -> Result<std::sync::MutexGuard<'_, Peripheral<C>>> {
    peripheral
        .lock()
        .map_err(|_| TransportError::Poisoned("peripheral").into())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use buscap_frame::command::{ACK_SIZE, COUNT_SIZE};
    use buscap_frame::{decode_record, LENGTH_PREFIX_SIZE};
    use buscap_transport::{SimTriggerLine, TriggerOutput};

    use super::*;

    struct BrokenCamera;

    impl Camera for BrokenCamera {
        fn capture(&mut self, _options: &CaptureOptions) -> std::io::Result<Bytes> {
            Err(std::io::Error::other("sensor offline"))
        }
    }

    fn config() -> PeripheralConfig {
        PeripheralConfig {
            max_chunk_size: 4,
            trigger_timeout_ms: 50,
            color_correction: false,
        }
    }

    /// Run one select/command/response/deselect transaction.
    fn transact<D: BusDevice>(device: &mut D, command: u8, response_len: usize) -> Vec<u8> {
        device.select(true);
        device.exchange(&[command]);
        let rx = device.exchange(&vec![0; response_len]);
        device.select(false);
        rx
    }

    fn read_packet<D: BusDevice>(device: &mut D) -> Option<Packet> {
        device.select(true);
        device.exchange(&[Command::RequestPacket.byte()]);
        let prefix = device.exchange(&[0; LENGTH_PREFIX_SIZE]);
        let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
        let packet = (len > 0).then(|| decode_record(&device.exchange(&vec![0; len])).unwrap());
        device.select(false);
        packet
    }

    #[test]
    fn addressed_capture_then_drain() {
        let mut peripheral = Peripheral::new(2, StaticCamera::new(&b"abcdefghij"[..]), config());

        assert_eq!(transact(&mut peripheral, Command::Capture.byte(), ACK_SIZE), vec![ACK]);
        assert_eq!(
            transact(&mut peripheral, Command::StatusOrCount.byte(), COUNT_SIZE),
            vec![0, 4]
        );

        let mut payload = Vec::new();
        while let Some(packet) = read_packet(&mut peripheral) {
            assert_eq!(packet.owner_id, 2);
            if packet.is_terminal {
                break;
            }
            payload.extend_from_slice(&packet.chunk);
        }
        assert_eq!(payload, b"abcdefghij");
        assert_eq!(peripheral.session().pending_count(), 0);
        assert_eq!(read_packet(&mut peripheral), None);
    }

    #[test]
    fn status_never_dequeues() {
        let mut peripheral = Peripheral::new(1, StaticCamera::new(&b"xyz"[..]), config());
        peripheral.capture().unwrap();

        for _ in 0..3 {
            assert_eq!(
                transact(&mut peripheral, Command::StatusOrCount.byte(), COUNT_SIZE),
                vec![0, 2]
            );
        }
        assert_eq!(peripheral.session().pending_count(), 2);
    }

    #[test]
    fn deselect_drops_partial_response() {
        let mut peripheral = Peripheral::new(1, StaticCamera::new(vec![5u8; 8]), config());
        peripheral.capture().unwrap();

        peripheral.select(true);
        peripheral.exchange(&[Command::RequestPacket.byte()]);
        peripheral.exchange(&[0; 3]);
        peripheral.select(false);

        // The partially clocked packet is gone; the next one follows.
        let next = read_packet(&mut peripheral).unwrap();
        assert_eq!(next.index, 1);
    }

    #[test]
    fn camera_failure_leaves_nothing_pending() {
        let mut peripheral = Peripheral::new(3, BrokenCamera, config());
        assert_eq!(transact(&mut peripheral, Command::Capture.byte(), ACK_SIZE), vec![NAK]);
        assert_eq!(
            transact(&mut peripheral, Command::StatusOrCount.byte(), COUNT_SIZE),
            vec![0, 0]
        );
        assert!(matches!(
            peripheral.session().last_failure(),
            Some(LinkError::CaptureFailure(_))
        ));
    }

    #[test]
    fn empty_image_reports_terminal_only() {
        let mut peripheral = Peripheral::new(1, StaticCamera::new(Bytes::new()), config());
        assert_eq!(peripheral.capture().unwrap(), 1);

        let terminal = read_packet(&mut peripheral).unwrap();
        assert!(terminal.is_terminal);
        assert_eq!(terminal.index, 0);
    }

    #[test]
    fn unknown_command_answers_ff() {
        let mut peripheral = Peripheral::new(1, StaticCamera::new(Bytes::new()), config());
        assert_eq!(transact(&mut peripheral, 0x42, 1), vec![UNKNOWN_COMMAND]);
    }

    #[test]
    fn trigger_timeout_reports_no_trigger() {
        let line = SimTriggerLine::new();
        let mut input = line.input();
        let mut peripheral = Peripheral::new(1, StaticCamera::new(vec![1u8; 4]), config());
        peripheral.capture().unwrap();

        let start = Instant::now();
        let result = peripheral.await_trigger(&mut input);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(LinkError::NoTrigger(_))));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(peripheral.session().pending_count(), 0);
        assert!(matches!(
            peripheral.session().last_failure(),
            Some(LinkError::NoTrigger(_))
        ));
    }

    #[test]
    fn trigger_edge_captures_outside_lock() {
        let line = SimTriggerLine::new();
        let mut input = line.input();
        let peripheral = Mutex::new(Peripheral::new(
            4,
            StaticCamera::new(vec![1u8; 9]),
            PeripheralConfig {
                trigger_timeout_ms: 5_000,
                ..config()
            },
        ));

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| run_trigger_cycle(&peripheral, &mut input));
            std::thread::sleep(Duration::from_millis(20));
            // The lock is free while the waiter blocks on the line.
            assert_eq!(peripheral.lock().unwrap().session().pending_count(), 0);
            let mut output = line.output();
            output.assert().unwrap();
            output.deassert().unwrap();
            assert_eq!(waiter.join().unwrap().unwrap(), 4);
        });
        assert_eq!(peripheral.lock().unwrap().session().captures(), 1);
    }
}
