//! Synchronized multi-camera capture over a shared half-duplex serial bus.
//!
//! A coordinator triggers capture on a selection of peripherals, then polls
//! each one in turn for its image as a sequence of bounded packets and
//! writes one artifact per device.
//!
//! # Crate Structure
//!
//! - [`transport`]: bus and trigger line abstractions (simulated, UDS-emulated)
//! - [`frame`]: packet model, packetizer and length-prefixed wire codec
//! - [`link`]: arbiter, trigger coordinator, retrieval, reassembly and the
//!   peripheral side (behind `link` feature)

/// Re-export transport types.
pub mod transport {
    pub use buscap_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use buscap_frame::*;
}

/// Re-export capture coordination types (requires `link` feature).
#[cfg(feature = "link")]
pub mod link {
    pub use buscap_link::*;
}
