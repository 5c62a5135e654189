use buscap_frame::command::{CAPTURE, REQUEST_PACKET, STATUS_OR_COUNT};
use buscap_frame::{max_chunk_for, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_PACKET_LEN};
use buscap_link::TriggerMode;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    println!("buscap {}", env!("CARGO_PKG_VERSION"));
    if !args.extended {
        return Ok(SUCCESS);
    }

    let build = |value: Option<&'static str>| value.unwrap_or("unknown");
    println!("target: {}", build(option_env!("BUSCAP_BUILD_TARGET")));
    println!("rustc: {}", build(option_env!("BUSCAP_RUSTC_VERSION")));
    println!(
        "buses: sim, uds={}",
        if cfg!(unix) { "yes" } else { "no" }
    );
    println!(
        "triggers: {} (sim only), {}",
        TriggerMode::Broadcast,
        TriggerMode::Addressed
    );
    println!(
        "commands: capture={CAPTURE:#04x} count={STATUS_OR_COUNT:#04x} packet={REQUEST_PACKET:#04x}"
    );
    println!(
        "packets: max_len={DEFAULT_MAX_PACKET_LEN} chunk={DEFAULT_MAX_CHUNK_SIZE} (max {})",
        max_chunk_for(DEFAULT_MAX_PACKET_LEN)
    );

    Ok(SUCCESS)
}
