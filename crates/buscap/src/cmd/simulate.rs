use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use buscap_link::{
    run_trigger_cycle, CancelFlag, Coordinator, Peripheral, StaticCamera, TriggerMode,
};
use buscap_transport::{SimBus, SimTriggerLine};
use bytes::Bytes;
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, round_exit_code, validate_config, SimulateArgs};
use crate::exit::{io_error, link_error, CliResult};
use crate::output::{print_report, OutputFormat};

type Waiter = JoinHandle<buscap_link::Result<u16>>;

pub fn run(args: SimulateArgs, format: OutputFormat) -> CliResult<i32> {
    let (mut config, devices) = args.round.resolve()?;
    if let Some(mode) = args.mode {
        config.trigger_mode = mode.into();
    }
    if let Some(chunk) = args.chunk_size {
        config.peripheral.max_chunk_size = chunk;
    }
    validate_config(&config)?;
    let image = match &args.image {
        Some(path) => Some(Bytes::from(std::fs::read(path).map_err(|err| {
            io_error(&format!("cannot read {}", path.display()), err)
        })?)),
        None => None,
    };

    let broadcast = config.trigger_mode == TriggerMode::Broadcast;
    let line = SimTriggerLine::new();
    let mut sim = SimBus::new();
    let mut waiters: Vec<(u32, Waiter)> = Vec::new();

    for (id, address) in config.devices.iter() {
        let payload = if args.empty.contains(&id) {
            Bytes::new()
        } else {
            image
                .clone()
                .unwrap_or_else(|| synthetic_image(id, args.payload_size))
        };
        let peripheral = Arc::new(Mutex::new(Peripheral::new(
            id,
            StaticCamera::new(payload),
            config.peripheral.clone(),
        )));
        sim.attach(address, peripheral.clone());

        if broadcast && devices.contains(&id) {
            let mut input = line.input();
            let handle = thread::spawn(move || run_trigger_cycle(&peripheral, &mut input));
            waiters.push((id, handle));
        }
    }

    let cancel = CancelFlag::new();
    let interrupt = cancel.clone();
    install_ctrlc_handler(move || interrupt.cancel())?;

    info!(mode = %config.trigger_mode, ?devices, "starting simulated capture round");
    let coordinator = if broadcast {
        Coordinator::broadcast(sim, line.output(), &config)
    } else {
        Coordinator::addressed(sim, &config)
    };
    let report = coordinator
        .with_cancel(cancel)
        .run(&devices)
        .map_err(|err| link_error("simulated capture failed", err))?;

    // Waiters only finish once the line has been pulsed.
    if line.rising_edges() > 0 {
        for (id, waiter) in waiters {
            match waiter.join() {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(device = id, error = %err, "simulated peripheral failed"),
                Err(_) => warn!(device = id, "simulated peripheral panicked"),
            }
        }
    }

    print_report(&report, format);
    Ok(round_exit_code(&report))
}

/// Deterministic stand-in image for device `id`.
fn synthetic_image(id: u32, len: usize) -> Bytes {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(id) as u8)
        .collect::<Vec<u8>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_image_differs_per_device() {
        let a = synthetic_image(1, 64);
        let b = synthetic_image(2, 64);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, synthetic_image(1, 64));
    }
}
