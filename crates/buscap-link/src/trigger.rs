use std::fmt;

use buscap_frame::command::{Command, ACK, ACK_SIZE};
use buscap_frame::DeviceId;
use buscap_transport::{BusTransport, TriggerOutput};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arbiter::BusArbiter;
use crate::cancel::CancelFlag;
use crate::config::TriggerTiming;
use crate::devices::DeviceMap;
use crate::error::{LinkError, Result};

/// How peripherals are told to capture.
///
/// Fixed when a coordinator is built; one round never mixes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// One shared line pulsed for every device at once.
    #[default]
    Broadcast,
    /// A capture command sent to each device over the bus.
    Addressed,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Broadcast => f.write_str("broadcast"),
            TriggerMode::Addressed => f.write_str("addressed"),
        }
    }
}

enum Topology {
    Broadcast(Box<dyn TriggerOutput>),
    Addressed,
}

/// Per-device result of triggering a selection.
#[derive(Debug, Default)]
pub struct TriggerReport {
    /// Devices that acknowledged (addressed) or were pulsed (broadcast).
    pub triggered: Vec<DeviceId>,
    /// Devices whose trigger failed, with the reason.
    pub failed: Vec<(DeviceId, LinkError)>,
}

/// Signals synchronized capture on a selection of peripherals.
pub struct TriggerCoordinator {
    topology: Topology,
    devices: DeviceMap,
    timing: TriggerTiming,
}

impl TriggerCoordinator {
    /// Shared-line topology driven through `line`.
    pub fn broadcast(
        line: impl TriggerOutput + 'static,
        devices: DeviceMap,
        timing: TriggerTiming,
    ) -> Self {
        Self {
            topology: Topology::Broadcast(Box::new(line)),
            devices,
            timing,
        }
    }

    /// Point-to-point topology: capture commands go over the bus.
    pub fn addressed(devices: DeviceMap, timing: TriggerTiming) -> Self {
        Self {
            topology: Topology::Addressed,
            devices,
            timing,
        }
    }

    pub fn mode(&self) -> TriggerMode {
        match self.topology {
            Topology::Broadcast(_) => TriggerMode::Broadcast,
            Topology::Addressed => TriggerMode::Addressed,
        }
    }

    pub fn devices(&self) -> &DeviceMap {
        &self.devices
    }

    pub fn timing(&self) -> &TriggerTiming {
        &self.timing
    }

    /// Validate a requested selection.
    ///
    /// Unknown ids are dropped with a warning and duplicates collapse to
    /// their first occurrence. Fails if nothing known remains.
    pub fn select_devices(&self, ids: &[DeviceId]) -> Result<Vec<DeviceId>> {
        if ids.is_empty() {
            return Err(LinkError::InvalidSelection("no devices requested".into()));
        }

        let mut selection = Vec::with_capacity(ids.len());
        for &id in ids {
            if !self.devices.contains(id) {
                warn!(device = id, "ignoring unknown device");
                continue;
            }
            if !selection.contains(&id) {
                selection.push(id);
            }
        }

        if selection.is_empty() {
            return Err(LinkError::InvalidSelection(format!(
                "none of {ids:?} are known devices"
            )));
        }
        debug!(?selection, "devices selected");
        Ok(selection)
    }

    /// Pulse the shared trigger line.
    ///
    /// The line is held for at least the configured pulse width and is
    /// always deasserted afterwards.
    pub fn broadcast_trigger(&mut self) -> Result<()> {
        let pulse = self.timing.pulse_width();
        let Topology::Broadcast(line) = &mut self.topology else {
            return Err(LinkError::UnsupportedTrigger(TriggerMode::Broadcast));
        };

        let asserted = line.assert();
        if asserted.is_ok() {
            std::thread::sleep(pulse);
        }
        let deasserted = line.deassert();
        asserted?;
        deasserted?;
        info!(pulse_ms = pulse.as_millis() as u64, "broadcast trigger sent");
        Ok(())
    }

    /// Send a capture command to one device and check its ack.
    pub fn addressed_trigger<B: BusTransport>(
        &self,
        arbiter: &mut BusArbiter<B>,
        device: DeviceId,
    ) -> Result<()> {
        let address = self.devices.address(device).ok_or_else(|| {
            LinkError::InvalidSelection(format!("device {device} is not mapped"))
        })?;

        let mut guard = arbiter.acquire(address)?;
        guard.send_command(Command::Capture)?;
        let reply = guard.clock_in(ACK_SIZE)?;
        guard.release()?;

        match reply.first().copied() {
            Some(ACK) => {
                debug!(device, %address, "capture acknowledged");
                Ok(())
            }
            other => Err(LinkError::NoAck {
                device,
                reply: other.unwrap_or_default(),
            }),
        }
    }

    /// Trigger every device in `selection` using the configured topology.
    ///
    /// Failures are recorded per device and never stop the others.
    pub fn trigger<B: BusTransport>(
        &mut self,
        arbiter: &mut BusArbiter<B>,
        selection: &[DeviceId],
        cancel: &CancelFlag,
    ) -> Result<TriggerReport> {
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }

        let mut report = TriggerReport::default();
        match self.mode() {
            TriggerMode::Broadcast => {
                self.broadcast_trigger()?;
                report.triggered.extend_from_slice(selection);
            }
            TriggerMode::Addressed => {
                for &device in selection {
                    if cancel.is_cancelled() {
                        return Err(LinkError::Cancelled);
                    }
                    match self.addressed_trigger(arbiter, device) {
                        Ok(()) => report.triggered.push(device),
                        Err(err) => {
                            warn!(device, error = %err, "addressed trigger failed");
                            report.failed.push((device, err));
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    /// Wait out the settle window so peripherals can finish capturing.
    pub fn settle(&self, cancel: &CancelFlag) -> Result<()> {
        let settle = self.timing.settle();
        debug!(settle_ms = settle.as_millis() as u64, "settling");
        if cancel.sleep(settle) {
            Ok(())
        } else {
            Err(LinkError::Cancelled)
        }
    }
}
