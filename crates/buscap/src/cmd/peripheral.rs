use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use buscap_link::{FileCamera, Peripheral};
use buscap_transport::UdsPort;
use tracing::info;

use crate::cmd::{install_ctrlc_handler, load_config, validate_config, PeripheralArgs};
use crate::exit::{io_error, transport_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: PeripheralArgs) -> CliResult<i32> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(chunk) = args.chunk_size {
        config.peripheral.max_chunk_size = chunk;
    }
    if let Some(timeout) = args.trigger_timeout_ms {
        config.peripheral.trigger_timeout_ms = timeout;
    }
    config.peripheral.color_correction |= args.color_correction;
    validate_config(&config)?;

    let address = config.devices.address(args.id).ok_or_else(|| {
        CliError::new(USAGE, format!("device {} is not in the device map", args.id))
    })?;
    std::fs::metadata(&args.image)
        .map_err(|err| io_error(&format!("cannot read {}", args.image.display()), err))?;
    std::fs::create_dir_all(&args.socket_dir)
        .map_err(|err| io_error(&format!("cannot create {}", args.socket_dir.display()), err))?;

    let port = UdsPort::bind_address(&args.socket_dir, address)
        .map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    install_ctrlc_handler(move || flag.store(false, Ordering::SeqCst))?;

    let idle = config.peripheral.trigger_timeout();
    let mut peripheral = Peripheral::new(args.id, FileCamera::new(&args.image), config.peripheral);
    info!(
        device = args.id,
        %address,
        socket = %port.path().display(),
        "peripheral ready"
    );

    port.serve(&mut peripheral, idle, &running)
        .map_err(|err| transport_error("serve failed", err))?;

    info!(
        device = args.id,
        captures = peripheral.session().captures(),
        "peripheral stopped"
    );
    Ok(SUCCESS)
}
