//! Shared serial bus and trigger line abstractions.
//!
//! This is the lowest layer of buscap. It defines the collaborator traits the
//! protocol is written against and ships two backends:
//! - an in-memory bus and trigger line (`sim`), used by tests and simulation
//! - a Unix domain socket emulation of the bus (`uds`), one socket per address
//!
//! Nothing in this crate knows about packets or commands.

pub mod error;
pub mod sim;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use sim::{SelectEvent, SelectTrace, SharedDevice, SimBus, SimTriggerLine};
pub use traits::{BusAddress, BusDevice, BusTransport, TriggerInput, TriggerOutput};

#[cfg(unix)]
pub use uds::{UdsBus, UdsPort};
