//! In-memory bus and trigger line.
//!
//! `SimBus` routes exchanges to [`BusDevice`] implementations attached at bus
//! addresses. An unattached address behaves like a floating line and reads
//! back zeros. Every select-line transition is appended to a shared
//! [`SelectTrace`] so exclusivity can be checked after the fact.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{BusAddress, BusDevice, BusTransport, TriggerInput, TriggerOutput};

/// A device shared between the bus and whoever drives its other side.
pub type SharedDevice = Arc<Mutex<dyn BusDevice>>;

/// One select-line transition observed on a [`SimBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectEvent {
    pub address: BusAddress,
    pub asserted: bool,
    /// Number of asserted lines right after this transition.
    pub selected_after: usize,
}

/// Cloneable view of the select-line history.
#[derive(Debug, Clone, Default)]
pub struct SelectTrace {
    events: Arc<Mutex<Vec<SelectEvent>>>,
}

impl SelectTrace {
    /// Snapshot of all transitions so far.
    pub fn events(&self) -> Vec<SelectEvent> {
        self.events
            .lock()
            .map(|events| events.to_vec())
            .unwrap_or_default()
    }

    /// Highest number of simultaneously asserted lines ever observed.
    pub fn max_concurrent(&self) -> usize {
        self.events()
            .iter()
            .map(|e| e.selected_after)
            .max()
            .unwrap_or(0)
    }

    fn push(&self, event: SelectEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Handle for an open exchange sequence on a [`SimBus`].
#[derive(Debug)]
pub struct SimHandle {
    address: BusAddress,
}

/// In-memory shared bus.
pub struct SimBus {
    devices: BTreeMap<BusAddress, SharedDevice>,
    selected: BTreeSet<BusAddress>,
    trace: SelectTrace,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            selected: BTreeSet::new(),
            trace: SelectTrace::default(),
        }
    }

    /// Attach a device at `address`, replacing any previous one.
    pub fn attach(&mut self, address: BusAddress, device: SharedDevice) {
        self.devices.insert(address, device);
    }

    /// Builder form of [`SimBus::attach`].
    pub fn with_device(mut self, address: BusAddress, device: SharedDevice) -> Self {
        self.attach(address, device);
        self
    }

    /// Select-line history shared with this bus.
    pub fn trace(&self) -> SelectTrace {
        self.trace.clone()
    }

    /// Addresses whose select line is currently asserted.
    pub fn selected(&self) -> Vec<BusAddress> {
        self.selected.iter().copied().collect()
    }

    /// True when every select line is deasserted.
    pub fn is_idle(&self) -> bool {
        self.selected.is_empty()
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTransport for SimBus {
    type Handle = SimHandle;

    fn open(&mut self, address: BusAddress) -> Result<SimHandle> {
        Ok(SimHandle { address })
    }

    fn transfer(&mut self, handle: &mut SimHandle, tx: &[u8]) -> Result<Vec<u8>> {
        let address = handle.address;
        if !self.selected.contains(&address) {
            return Err(TransportError::NotSelected(address));
        }

        let rx = match self.devices.get(&address) {
            Some(device) => device
                .lock()
                .map_err(|_| TransportError::Poisoned("bus device"))?
                .exchange(tx),
            None => vec![0u8; tx.len()],
        };
        trace!(%address, tx = tx.len(), rx = rx.len(), "sim exchange");

        if rx.len() != tx.len() {
            return Err(TransportError::ShortExchange {
                address,
                expected: tx.len(),
                got: rx.len(),
            });
        }
        Ok(rx)
    }

    fn close(&mut self, _handle: SimHandle) -> Result<()> {
        Ok(())
    }

    fn set_select(&mut self, address: BusAddress, asserted: bool) -> Result<()> {
        let changed = if asserted {
            self.selected.insert(address)
        } else {
            self.selected.remove(&address)
        };
        if !changed {
            return Ok(());
        }

        self.trace.push(SelectEvent {
            address,
            asserted,
            selected_after: self.selected.len(),
        });

        if let Some(device) = self.devices.get(&address) {
            device
                .lock()
                .map_err(|_| TransportError::Poisoned("bus device"))?
                .select(asserted);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LineState {
    level: bool,
    rising_edges: u64,
}

type SharedLine = Arc<(Mutex<LineState>, Condvar)>;

/// In-memory shared trigger line.
///
/// One output drives the line; any number of inputs observe rising edges.
/// An input only reports edges raised after it was created, so inputs must
/// be taken before the coordinator pulses the line.
#[derive(Debug, Clone, Default)]
pub struct SimTriggerLine {
    shared: SharedLine,
}

impl SimTriggerLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator-side driver.
    pub fn output(&self) -> SimTriggerOutput {
        SimTriggerOutput {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Peripheral-side observer armed at the current edge count.
    pub fn input(&self) -> SimTriggerInput {
        let seen = self.rising_edges();
        SimTriggerInput {
            shared: Arc::clone(&self.shared),
            seen,
        }
    }

    /// Current line level.
    pub fn level(&self) -> bool {
        self.shared.0.lock().map(|s| s.level).unwrap_or(false)
    }

    /// Total rising edges since creation.
    pub fn rising_edges(&self) -> u64 {
        self.shared.0.lock().map(|s| s.rising_edges).unwrap_or(0)
    }
}

/// Drives a [`SimTriggerLine`].
#[derive(Debug)]
pub struct SimTriggerOutput {
    shared: SharedLine,
}

impl SimTriggerOutput {
    fn drive(&self, level: bool) -> Result<()> {
        let (lock, cvar) = &*self.shared;
        let mut state = lock
            .lock()
            .map_err(|_| TransportError::Poisoned("trigger line"))?;
        if level && !state.level {
            state.rising_edges += 1;
        }
        state.level = level;
        cvar.notify_all();
        Ok(())
    }
}

impl TriggerOutput for SimTriggerOutput {
    fn assert(&mut self) -> Result<()> {
        self.drive(true)
    }

    fn deassert(&mut self) -> Result<()> {
        self.drive(false)
    }
}

/// Observes rising edges on a [`SimTriggerLine`].
#[derive(Debug)]
pub struct SimTriggerInput {
    shared: SharedLine,
    seen: u64,
}

impl TriggerInput for SimTriggerInput {
    fn wait_for_edge(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.shared;
        let mut state = lock
            .lock()
            .map_err(|_| TransportError::Poisoned("trigger line"))?;

        while state.rising_edges == self.seen {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (next, _) = cvar
                .wait_timeout(state, deadline - now)
                .map_err(|_| TransportError::Poisoned("trigger line"))?;
            state = next;
        }

        self.seen = state.rising_edges;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        selected: bool,
        transitions: Vec<bool>,
    }

    impl BusDevice for Echo {
        fn select(&mut self, asserted: bool) {
            self.selected = asserted;
            self.transitions.push(asserted);
        }

        fn exchange(&mut self, tx: &[u8]) -> Vec<u8> {
            tx.iter().map(|b| b.wrapping_add(1)).collect()
        }
    }

    struct Truncating;

    impl BusDevice for Truncating {
        fn select(&mut self, _asserted: bool) {}

        fn exchange(&mut self, _tx: &[u8]) -> Vec<u8> {
            vec![0]
        }
    }

    fn echo() -> Arc<Mutex<Echo>> {
        Arc::new(Mutex::new(Echo {
            selected: false,
            transitions: Vec::new(),
        }))
    }

    #[test]
    fn transfer_requires_select() {
        let addr = BusAddress::new(0, 0);
        let mut bus = SimBus::new().with_device(addr, echo());
        let mut handle = bus.open(addr).unwrap();

        let err = bus.transfer(&mut handle, &[1]).unwrap_err();
        assert!(matches!(err, TransportError::NotSelected(a) if a == addr));

        bus.set_select(addr, true).unwrap();
        assert_eq!(bus.transfer(&mut handle, &[1, 2]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn floating_address_reads_zeros() {
        let addr = BusAddress::new(1, 2);
        let mut bus = SimBus::new();
        bus.set_select(addr, true).unwrap();
        let mut handle = bus.open(addr).unwrap();
        assert_eq!(bus.transfer(&mut handle, &[7, 7, 7]).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn short_exchange_is_rejected() {
        let addr = BusAddress::new(0, 0);
        let mut bus = SimBus::new().with_device(addr, Arc::new(Mutex::new(Truncating)));
        bus.set_select(addr, true).unwrap();
        let mut handle = bus.open(addr).unwrap();
        let err = bus.transfer(&mut handle, &[0, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::ShortExchange {
                expected: 3,
                got: 1,
                ..
            }
        ));
    }

    #[test]
    fn select_transitions_are_traced_and_forwarded() {
        let addr = BusAddress::new(0, 1);
        let device = echo();
        let shared: SharedDevice = device.clone();
        let mut bus = SimBus::new().with_device(addr, shared);
        let trace = bus.trace();

        bus.set_select(addr, true).unwrap();
        bus.set_select(addr, true).unwrap();
        bus.set_select(addr, false).unwrap();
        bus.set_select(addr, false).unwrap();

        assert_eq!(trace.events().len(), 2);
        assert_eq!(trace.max_concurrent(), 1);
        assert!(bus.is_idle());

        let device = device.lock().unwrap();
        assert_eq!(device.transitions, vec![true, false]);
        assert!(!device.selected);
    }

    #[test]
    fn trigger_edge_wakes_waiter() {
        let line = SimTriggerLine::new();
        let mut input = line.input();
        let mut output = line.output();

        let waiter =
            std::thread::spawn(move || input.wait_for_edge(Duration::from_secs(5)).unwrap());

        std::thread::sleep(Duration::from_millis(20));
        output.assert().unwrap();
        output.deassert().unwrap();

        assert!(waiter.join().unwrap());
        assert_eq!(line.rising_edges(), 1);
        assert!(!line.level());
    }

    #[test]
    fn edge_before_wait_is_not_lost() {
        let line = SimTriggerLine::new();
        let mut input = line.input();
        let mut output = line.output();

        output.assert().unwrap();
        output.deassert().unwrap();

        assert!(input.wait_for_edge(Duration::from_millis(10)).unwrap());
        assert!(!input.wait_for_edge(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn trigger_wait_times_out() {
        let line = SimTriggerLine::new();
        let mut input = line.input();

        let start = Instant::now();
        let fired = input.wait_for_edge(Duration::from_millis(50)).unwrap();
        let elapsed = start.elapsed();

        assert!(!fired);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn holding_the_line_high_is_one_edge() {
        let line = SimTriggerLine::new();
        let mut output = line.output();
        output.assert().unwrap();
        output.assert().unwrap();
        assert_eq!(line.rising_edges(), 1);
        assert!(line.level());
    }
}
