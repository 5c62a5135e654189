use std::time::Duration;

use buscap_frame::command::Command;
use buscap_transport::{BusAddress, BusTransport, TransportError};
use tracing::{debug, warn};

use crate::config::ArbiterConfig;
use crate::error::Result;

/// Grants exclusive access to one device at a time on the shared bus.
///
/// A device is addressable only through the [`BusGuard`] returned by
/// [`BusArbiter::acquire`]. The guard borrows the arbiter mutably, so a second
/// device cannot be acquired until the first guard is released or dropped.
pub struct BusArbiter<B: BusTransport> {
    transport: B,
    known: Vec<BusAddress>,
    open_attempts: u32,
    open_backoff: Duration,
}

impl<B: BusTransport> BusArbiter<B> {
    pub fn new(transport: B, known: impl IntoIterator<Item = BusAddress>) -> Self {
        Self::with_config(transport, known, &ArbiterConfig::default())
    }

    pub fn with_config(
        transport: B,
        known: impl IntoIterator<Item = BusAddress>,
        config: &ArbiterConfig,
    ) -> Self {
        let mut known: Vec<BusAddress> = known.into_iter().collect();
        known.sort();
        known.dedup();
        Self {
            transport,
            known,
            open_attempts: config.open_attempts.max(1),
            open_backoff: config.open_backoff(),
        }
    }

    pub fn transport(&self) -> &B {
        &self.transport
    }

    pub fn into_transport(self) -> B {
        self.transport
    }

    /// Deassert every known select line.
    pub fn release_all(&mut self) -> Result<()> {
        for address in self.known.clone() {
            self.transport.set_select(address, false)?;
        }
        Ok(())
    }

    /// Select `address` exclusively and open a handle to it.
    ///
    /// Every other known select line is deasserted before the target is
    /// asserted. Select and open faults are retried up to the configured
    /// attempt bound.
    pub fn acquire(&mut self, address: BusAddress) -> Result<BusGuard<'_, B>> {
        if !self.known.contains(&address) {
            self.known.push(address);
        }

        let handle = self.open_with_retry(address)?;
        debug!(%address, "bus acquired");
        Ok(BusGuard {
            arbiter: self,
            address,
            handle: Some(handle),
        })
    }

    fn open_with_retry(&mut self, address: BusAddress) -> Result<B::Handle> {
        let mut attempt = 1;
        loop {
            match self.try_open(address) {
                Ok(handle) => return Ok(handle),
                Err(err) if attempt < self.open_attempts => {
                    warn!(%address, attempt, error = %err, "bus open failed, retrying");
                    attempt += 1;
                    std::thread::sleep(self.open_backoff);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn try_open(&mut self, address: BusAddress) -> std::result::Result<B::Handle, TransportError> {
        for other in self.known.iter().copied().filter(|a| *a != address) {
            self.transport.set_select(other, false)?;
        }
        self.transport.set_select(address, true)?;

        match self.transport.open(address) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if let Err(deselect) = self.transport.set_select(address, false) {
                    warn!(%address, error = %deselect, "deselect after failed open");
                }
                Err(err)
            }
        }
    }
}

/// Exclusive access to one selected device.
///
/// Releasing (explicitly or by drop) closes the handle and deasserts the
/// select line, leaving the bus idle.
pub struct BusGuard<'a, B: BusTransport> {
    arbiter: &'a mut BusArbiter<B>,
    address: BusAddress,
    handle: Option<B::Handle>,
}

impl<B: BusTransport> BusGuard<'_, B> {
    pub fn address(&self) -> BusAddress {
        self.address
    }

    /// One full-duplex exchange. The reply must be as long as `tx`.
    pub fn transfer(&mut self, tx: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        let handle = self.handle.as_mut().ok_or(TransportError::Shutdown)?;
        let rx = self.arbiter.transport.transfer(handle, tx)?;
        if rx.len() != tx.len() {
            return Err(TransportError::ShortExchange {
                address: self.address,
                expected: tx.len(),
                got: rx.len(),
            });
        }
        Ok(rx)
    }

    /// Send a command byte. The byte clocked back is ignored.
    pub fn send_command(&mut self, command: Command) -> std::result::Result<(), TransportError> {
        self.transfer(&[command.byte()]).map(|_| ())
    }

    /// Clock `n` response bytes in with zero bytes out.
    pub fn clock_in(&mut self, n: usize) -> std::result::Result<Vec<u8>, TransportError> {
        self.transfer(&vec![0u8; n])
    }

    /// Close the handle and deassert the select line.
    pub fn release(mut self) -> Result<()> {
        self.finish().map_err(Into::into)
    }

    fn finish(&mut self) -> std::result::Result<(), TransportError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let closed = self.arbiter.transport.close(handle);
        let deselected = self.arbiter.transport.set_select(self.address, false);
        debug!(address = %self.address, "bus released");
        closed?;
        deselected
    }
}

impl<B: BusTransport> Drop for BusGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(address = %self.address, error = %err, "bus release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use buscap_transport::{BusDevice, SimBus};

    use super::*;

    struct Loopback;

    impl BusDevice for Loopback {
        fn select(&mut self, _asserted: bool) {}

        fn exchange(&mut self, tx: &[u8]) -> Vec<u8> {
            tx.to_vec()
        }
    }

    fn bus() -> SimBus {
        SimBus::new()
            .with_device(BusAddress::new(0, 0), Arc::new(Mutex::new(Loopback)))
            .with_device(BusAddress::new(0, 1), Arc::new(Mutex::new(Loopback)))
    }

    fn known() -> Vec<BusAddress> {
        vec![BusAddress::new(0, 0), BusAddress::new(0, 1)]
    }

    #[test]
    fn guard_release_returns_bus_to_idle() {
        let mut arbiter = BusArbiter::new(bus(), known());
        let mut guard = arbiter.acquire(BusAddress::new(0, 1)).unwrap();
        assert_eq!(guard.transfer(&[1, 2, 3]).unwrap(), vec![1, 2, 3]);
        guard.release().unwrap();

        assert!(arbiter.transport().is_idle());
    }

    #[test]
    fn dropped_guard_releases() {
        let mut arbiter = BusArbiter::new(bus(), known());
        {
            let _guard = arbiter.acquire(BusAddress::new(0, 0)).unwrap();
        }
        assert!(arbiter.transport().is_idle());
    }

    #[test]
    fn never_two_lines_selected() {
        let mut arbiter = BusArbiter::new(bus(), known());
        for round in 0..4u8 {
            let address = BusAddress::new(0, round % 2);
            let mut guard = arbiter.acquire(address).unwrap();
            guard.clock_in(2).unwrap();
            guard.release().unwrap();
        }
        assert_eq!(arbiter.transport().trace().max_concurrent(), 1);
    }

    #[test]
    fn stale_select_is_cleared_before_acquire() {
        let mut sim = bus();
        sim.set_select(BusAddress::new(0, 0), true).unwrap();
        let mut arbiter = BusArbiter::new(sim, known());

        let guard = arbiter.acquire(BusAddress::new(0, 1)).unwrap();
        drop(guard);

        let events = arbiter.transport().trace().events();
        assert!(events.iter().all(|e| e.selected_after <= 1));
        assert!(arbiter.transport().is_idle());
    }

    struct FlakyOpen {
        failures_left: u32,
        opens: u32,
    }

    impl BusTransport for FlakyOpen {
        type Handle = ();

        fn open(&mut self, address: BusAddress) -> buscap_transport::Result<()> {
            self.opens += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TransportError::NotSelected(address));
            }
            Ok(())
        }

        fn transfer(&mut self, _: &mut (), tx: &[u8]) -> buscap_transport::Result<Vec<u8>> {
            Ok(vec![0; tx.len()])
        }

        fn close(&mut self, _: ()) -> buscap_transport::Result<()> {
            Ok(())
        }

        fn set_select(&mut self, _: BusAddress, _: bool) -> buscap_transport::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn open_faults_are_retried_up_to_bound() {
        let config = ArbiterConfig {
            open_attempts: 3,
            open_backoff_ms: 0,
        };
        let flaky = FlakyOpen {
            failures_left: 2,
            opens: 0,
        };
        let mut arbiter = BusArbiter::with_config(flaky, known(), &config);
        arbiter.acquire(BusAddress::new(0, 0)).unwrap().release().unwrap();
        assert_eq!(arbiter.transport().opens, 3);

        let flaky = FlakyOpen {
            failures_left: 5,
            opens: 0,
        };
        let mut arbiter = BusArbiter::with_config(flaky, known(), &config);
        assert!(matches!(
            arbiter.acquire(BusAddress::new(0, 0)),
            Err(crate::LinkError::TransportFault(_))
        ));
        assert_eq!(arbiter.transport().opens, 3);
    }

    struct Short;

    impl BusDevice for Short {
        fn select(&mut self, _asserted: bool) {}

        fn exchange(&mut self, tx: &[u8]) -> Vec<u8> {
            vec![0; tx.len().saturating_sub(1)]
        }
    }

    #[test]
    fn short_exchange_is_a_transport_fault() {
        let sim = SimBus::new().with_device(BusAddress::new(0, 0), Arc::new(Mutex::new(Short)));
        let mut arbiter = BusArbiter::new(sim, known());
        let mut guard = arbiter.acquire(BusAddress::new(0, 0)).unwrap();
        assert!(matches!(
            guard.transfer(&[1, 2]),
            Err(TransportError::ShortExchange { .. })
        ));
        drop(guard);
        assert!(arbiter.transport().is_idle());
    }
}
