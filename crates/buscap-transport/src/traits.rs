use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Physical location of a peripheral on the shared bus.
///
/// `channel` is the bus (controller) number and `select` the select line on
/// that bus. Two devices never share an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusAddress {
    pub channel: u8,
    pub select: u8,
}

impl BusAddress {
    pub const fn new(channel: u8, select: u8) -> Self {
        Self { channel, select }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus{}/cs{}", self.channel, self.select)
    }
}

/// Coordinator-side view of the shared, half-duplex bus.
///
/// Every `transfer` is a synchronous full-duplex exchange: the bytes in `tx`
/// are clocked out while the same number of bytes are clocked in. Select
/// lines are driven separately so that an arbiter can enforce exclusivity
/// above this layer.
pub trait BusTransport {
    /// Open handle for one addressed exchange sequence.
    type Handle;

    /// Open a handle for the device at `address`.
    fn open(&mut self, address: BusAddress) -> Result<Self::Handle>;

    /// Clock `tx` out and return the bytes clocked in.
    fn transfer(&mut self, handle: &mut Self::Handle, tx: &[u8]) -> Result<Vec<u8>>;

    /// Close a handle previously returned by [`BusTransport::open`].
    fn close(&mut self, handle: Self::Handle) -> Result<()>;

    /// Drive the select line for `address`.
    fn set_select(&mut self, address: BusAddress, asserted: bool) -> Result<()>;
}

/// Peripheral end of the bus.
///
/// Implementations see the select line transitions and each exchange the
/// coordinator clocks while the line is asserted.
pub trait BusDevice: Send {
    /// Select line transition for this device.
    fn select(&mut self, asserted: bool);

    /// Answer one exchange. The returned buffer must be `tx.len()` bytes.
    fn exchange(&mut self, tx: &[u8]) -> Vec<u8>;

    /// Called when the device has seen no bus activity for its idle window.
    fn idle(&mut self) {}
}

/// Coordinator side of the shared trigger line.
pub trait TriggerOutput: Send {
    fn assert(&mut self) -> Result<()>;
    fn deassert(&mut self) -> Result<()>;
}

/// Peripheral side of the shared trigger line.
pub trait TriggerInput: Send {
    /// Block until a rising edge is observed or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Never blocks past `timeout`.
    fn wait_for_edge(&mut self, timeout: Duration) -> Result<bool>;
}

impl<T: TriggerOutput + ?Sized> TriggerOutput for Box<T> {
    fn assert(&mut self) -> Result<()> {
        (**self).assert()
    }

    fn deassert(&mut self) -> Result<()> {
        (**self).deassert()
    }
}

impl<T: TriggerInput + ?Sized> TriggerInput for Box<T> {
    fn wait_for_edge(&mut self, timeout: Duration) -> Result<bool> {
        (**self).wait_for_edge(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display() {
        assert_eq!(BusAddress::new(1, 2).to_string(), "bus1/cs2");
    }

    #[test]
    fn addresses_order_by_channel_then_select() {
        let mut addrs = vec![
            BusAddress::new(1, 0),
            BusAddress::new(0, 1),
            BusAddress::new(0, 0),
        ];
        addrs.sort();
        assert_eq!(
            addrs,
            vec![
                BusAddress::new(0, 0),
                BusAddress::new(0, 1),
                BusAddress::new(1, 0)
            ]
        );
    }
}
