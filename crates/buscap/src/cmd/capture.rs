use std::time::Duration;

use buscap_link::{CancelFlag, Coordinator, TriggerMode};
use buscap_transport::UdsBus;
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, round_exit_code, validate_config, CaptureArgs};
use crate::exit::{link_error, CliResult};
use crate::output::{print_report, OutputFormat};

pub fn run(args: CaptureArgs, format: OutputFormat) -> CliResult<i32> {
    let (config, devices) = args.round.resolve()?;
    validate_config(&config)?;
    if config.trigger_mode == TriggerMode::Broadcast {
        // Socket peripherals share no trigger line.
        warn!("broadcast trigger is unavailable on the socket bus; sending capture commands");
    }

    let bus = UdsBus::new(&args.socket_dir)
        .with_io_timeout(Some(Duration::from_millis(args.io_timeout_ms)));
    let cancel = CancelFlag::new();
    let interrupt = cancel.clone();
    install_ctrlc_handler(move || interrupt.cancel())?;

    info!(socket_dir = %args.socket_dir.display(), ?devices, "starting capture round");
    let mut coordinator = Coordinator::addressed(bus, &config).with_cancel(cancel);
    let report = coordinator
        .run(&devices)
        .map_err(|err| link_error("capture failed", err))?;

    print_report(&report, format);
    Ok(round_exit_code(&report))
}
