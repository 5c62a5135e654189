use std::path::PathBuf;

use buscap_frame::DeviceId;
use buscap_transport::{BusAddress, BusTransport, TriggerOutput};
use chrono::{DateTime, Local};
use tracing::{info, warn};

use crate::arbiter::BusArbiter;
use crate::cancel::CancelFlag;
use crate::config::{CoordinatorConfig, RetrievalConfig};
use crate::error::{LinkError, Result};
use crate::reassembler::Reassembler;
use crate::session::TransportSession;
use crate::trigger::{TriggerCoordinator, TriggerMode};

/// What happened to one device in a capture round.
#[derive(Debug)]
pub enum DeviceOutcome {
    /// An artifact was written. `gaps` and `skipped` list packet indices.
    Saved {
        path: PathBuf,
        bytes: usize,
        packets: usize,
        gaps: Vec<u16>,
        skipped: Vec<u16>,
    },
    /// The device delivered an empty image without any faulted packets.
    NoImage,
    /// Triggering, retrieval or persisting failed.
    Failed(LinkError),
    /// The round was interrupted before this device finished.
    Cancelled,
}

impl DeviceOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, DeviceOutcome::Saved { .. })
    }

    /// Short label for tables and logs.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceOutcome::Saved { .. } => "saved",
            DeviceOutcome::NoImage => "no-image",
            DeviceOutcome::Failed(_) => "failed",
            DeviceOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct DeviceReport {
    pub device: DeviceId,
    pub address: BusAddress,
    pub outcome: DeviceOutcome,
}

/// Result of one capture-and-retrieve round.
#[derive(Debug)]
pub struct CaptureReport {
    /// Names every artifact written in this round.
    pub session: DateTime<Local>,
    pub mode: TriggerMode,
    pub devices: Vec<DeviceReport>,
}

impl CaptureReport {
    pub fn saved(&self) -> usize {
        self.devices.iter().filter(|d| d.outcome.is_saved()).count()
    }

    pub fn cancelled(&self) -> bool {
        self.devices
            .iter()
            .any(|d| matches!(d.outcome, DeviceOutcome::Cancelled))
    }
}

/// Runs capture rounds: select, trigger, settle, then retrieve and persist
/// each device in turn.
pub struct Coordinator<B: BusTransport> {
    arbiter: BusArbiter<B>,
    trigger: TriggerCoordinator,
    reassembler: Reassembler,
    retrieval: RetrievalConfig,
    cancel: CancelFlag,
}

impl<B: BusTransport> Coordinator<B> {
    /// Coordinator that triggers by pulsing a shared line.
    pub fn broadcast(
        transport: B,
        line: impl TriggerOutput + 'static,
        config: &CoordinatorConfig,
    ) -> Self {
        let trigger =
            TriggerCoordinator::broadcast(line, config.devices.clone(), config.trigger.clone());
        Self::with_trigger(transport, trigger, config)
    }

    /// Coordinator that triggers with per-device capture commands.
    pub fn addressed(transport: B, config: &CoordinatorConfig) -> Self {
        let trigger =
            TriggerCoordinator::addressed(config.devices.clone(), config.trigger.clone());
        Self::with_trigger(transport, trigger, config)
    }

    fn with_trigger(transport: B, trigger: TriggerCoordinator, config: &CoordinatorConfig) -> Self {
        let arbiter =
            BusArbiter::with_config(transport, config.devices.addresses(), &config.arbiter);
        Self {
            arbiter,
            trigger,
            reassembler: Reassembler::new(config.reassembler.clone()),
            retrieval: config.retrieval.clone(),
            cancel: CancelFlag::new(),
        }
    }

    /// Share an externally raised cancel flag.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn mode(&self) -> TriggerMode {
        self.trigger.mode()
    }

    pub fn arbiter(&self) -> &BusArbiter<B> {
        &self.arbiter
    }

    /// Run one capture round over `ids`.
    ///
    /// Only an invalid selection or a broken trigger line fails the round;
    /// everything else is recorded per device.
    pub fn run(&mut self, ids: &[DeviceId]) -> Result<CaptureReport> {
        let selection = self.trigger.select_devices(ids)?;
        let mut report = CaptureReport {
            session: Local::now(),
            mode: self.trigger.mode(),
            devices: Vec::with_capacity(selection.len()),
        };
        info!(mode = %report.mode, ?selection, "capture round started");

        let result = self.run_selection(&selection, &mut report);
        if let Err(err) = self.arbiter.release_all() {
            warn!(error = %err, "failed to return bus to idle");
        }
        result?;

        info!(
            saved = report.saved(),
            devices = report.devices.len(),
            "capture round finished"
        );
        Ok(report)
    }

    fn run_selection(&mut self, selection: &[DeviceId], report: &mut CaptureReport) -> Result<()> {
        self.arbiter.release_all()?;

        let triggered = match self.trigger.trigger(&mut self.arbiter, selection, &self.cancel) {
            Ok(triggered) => triggered,
            Err(LinkError::Cancelled) => {
                self.mark_cancelled(selection, report);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let mut trigger_failures = triggered.failed;

        if let Err(err) = self.trigger.settle(&self.cancel) {
            if matches!(err, LinkError::Cancelled) {
                self.mark_cancelled(selection, report);
                return Ok(());
            }
            return Err(err);
        }

        for &device in selection {
            let address = self.address_of(device)?;
            let outcome = if self.cancel.is_cancelled() {
                DeviceOutcome::Cancelled
            } else if let Some(pos) = trigger_failures.iter().position(|(id, _)| *id == device) {
                DeviceOutcome::Failed(trigger_failures.swap_remove(pos).1)
            } else {
                self.retrieve_device(device, address, &report.session)
            };
            info!(device, %address, outcome = outcome.label(), "device processed");
            report.devices.push(DeviceReport {
                device,
                address,
                outcome,
            });
        }
        Ok(())
    }

    fn retrieve_device(
        &mut self,
        device: DeviceId,
        address: BusAddress,
        session: &DateTime<Local>,
    ) -> DeviceOutcome {
        let mut transport = TransportSession::new(
            &mut self.arbiter,
            device,
            address,
            self.retrieval.clone(),
            self.cancel.clone(),
        );
        let retrieval = match transport.retrieve_all() {
            Ok(retrieval) => retrieval,
            Err(LinkError::Cancelled) => return DeviceOutcome::Cancelled,
            Err(err) => {
                warn!(device, error = %err, "retrieval failed");
                return DeviceOutcome::Failed(err);
            }
        };

        let skipped = retrieval.skipped.iter().map(|s| s.index).collect();
        match self
            .reassembler
            .assemble(&retrieval.batch, &session.naive_local())
        {
            Ok(artifact) => DeviceOutcome::Saved {
                path: artifact.path,
                bytes: artifact.bytes,
                packets: artifact.packets,
                gaps: artifact.gaps,
                skipped,
            },
            Err(LinkError::NoImage(_)) => match retrieval.skipped.into_iter().next() {
                // Nothing usable arrived, but the device did declare data.
                Some(first) => {
                    warn!(device, error = %first.error, "every image packet faulted");
                    DeviceOutcome::Failed(first.error)
                }
                None => DeviceOutcome::NoImage,
            },
            Err(err) => {
                warn!(device, error = %err, "artifact not written");
                DeviceOutcome::Failed(err)
            }
        }
    }

    fn mark_cancelled(&self, selection: &[DeviceId], report: &mut CaptureReport) {
        warn!("capture round cancelled");
        for &device in selection {
            if let Ok(address) = self.address_of(device) {
                report.devices.push(DeviceReport {
                    device,
                    address,
                    outcome: DeviceOutcome::Cancelled,
                });
            }
        }
    }

    fn address_of(&self, device: DeviceId) -> Result<BusAddress> {
        self.trigger.devices().address(device).ok_or_else(|| {
            LinkError::InvalidSelection(format!("device {device} is not mapped"))
        })
    }
}
