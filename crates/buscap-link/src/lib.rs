//! Capture coordination over a shared serial bus.
//!
//! This is the protocol layer. A [`Coordinator`] triggers a selection of
//! peripherals, then retrieves and persists each one's image in turn with
//! exclusive bus access. [`Peripheral`] is the matching device side.

pub mod arbiter;
pub mod cancel;
pub mod capture;
pub mod config;
pub mod devices;
pub mod error;
pub mod peripheral;
pub mod reassembler;
pub mod session;
pub mod trigger;

pub use arbiter::{BusArbiter, BusGuard};
pub use cancel::CancelFlag;
pub use capture::{CaptureReport, Coordinator, DeviceOutcome, DeviceReport};
pub use config::{
    ArbiterConfig, CoordinatorConfig, PeripheralConfig, ReassemblerConfig, RetrievalConfig,
    TriggerTiming,
};
pub use devices::{DeviceEntry, DeviceMap};
pub use error::{LinkError, Result};
pub use peripheral::{
    run_trigger_cycle, Camera, CaptureOptions, FileCamera, Peripheral, PeripheralSession,
    StaticCamera,
};
pub use reassembler::{reassemble, Artifact, Reassembler, Reassembly};
pub use session::{AbortReason, Retrieval, SessionState, SkippedPacket, TransportSession};
pub use trigger::{TriggerCoordinator, TriggerMode, TriggerReport};
