use std::path::{Path, PathBuf};

use buscap_link::{CaptureReport, CoordinatorConfig, DeviceOutcome, TriggerMode};
use clap::{Args, Subcommand, ValueEnum};

use crate::exit::{
    io_error, link_error, CliError, CliResult, DATA_INVALID, FAILURE, INTERRUPTED, SUCCESS,
};
use crate::output::OutputFormat;

#[cfg(unix)]
pub mod capture;
#[cfg(unix)]
pub mod peripheral;
pub mod simulate;
pub mod version;

const DEFAULT_SOCKET_DIR: &str = "/tmp/buscap";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one capture round against peripherals on the socket bus.
    Capture(CaptureArgs),
    /// Serve one camera peripheral on the socket bus.
    Peripheral(PeripheralArgs),
    /// Run one capture round against in-process simulated peripherals.
    Simulate(SimulateArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        #[cfg(unix)]
        Command::Capture(args) => capture::run(args, format),
        #[cfg(unix)]
        Command::Peripheral(args) => peripheral::run(args),
        #[cfg(not(unix))]
        Command::Capture(_) | Command::Peripheral(_) => Err(CliError::new(
            crate::exit::USAGE,
            "the socket bus requires Unix domain sockets; use `simulate`",
        )),
        Command::Simulate(args) => simulate::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Options shared by every command that runs a capture round.
#[derive(Args, Debug)]
pub struct RoundArgs {
    /// Devices to capture from (comma-separated ids). Default: every mapped device.
    #[arg(long, value_delimiter = ',')]
    pub devices: Option<Vec<u32>>,
    /// JSON configuration file.
    #[arg(long, value_name = "FILE", env = "BUSCAP_CONFIG")]
    pub config: Option<PathBuf>,
    /// Directory for captured artifacts.
    #[arg(long, value_name = "DIR", env = "BUSCAP_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,
    /// Wait between trigger and retrieval, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub settle_ms: Option<u64>,
}

impl RoundArgs {
    /// Load the configuration, apply overrides and pick the device selection.
    pub fn resolve(&self) -> CliResult<(CoordinatorConfig, Vec<u32>)> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(dir) = &self.output_dir {
            config.reassembler.output_dir = dir.clone();
        }
        if let Some(settle) = self.settle_ms {
            config.trigger.settle_ms = settle;
        }
        let devices = self
            .devices
            .clone()
            .unwrap_or_else(|| config.devices.ids());
        Ok((config, devices))
    }
}

#[derive(Args, Debug)]
pub struct CaptureArgs {
    #[command(flatten)]
    pub round: RoundArgs,
    /// Directory holding the peripherals' bus sockets.
    #[arg(long, value_name = "DIR", env = "BUSCAP_SOCKET_DIR", default_value = DEFAULT_SOCKET_DIR)]
    pub socket_dir: PathBuf,
    /// Per-exchange I/O timeout in milliseconds.
    #[arg(long, value_name = "MS", default_value = "5000")]
    pub io_timeout_ms: u64,
}

#[derive(Args, Debug)]
pub struct PeripheralArgs {
    /// Device id to serve. Its bus address comes from the device map.
    #[arg(long)]
    pub id: u32,
    /// Image file returned on every capture.
    #[arg(long, value_name = "FILE")]
    pub image: PathBuf,
    /// Directory to create the bus socket in.
    #[arg(long, value_name = "DIR", env = "BUSCAP_SOCKET_DIR", default_value = DEFAULT_SOCKET_DIR)]
    pub socket_dir: PathBuf,
    /// JSON configuration file.
    #[arg(long, value_name = "FILE", env = "BUSCAP_CONFIG")]
    pub config: Option<PathBuf>,
    /// Largest image chunk per packet.
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,
    /// Idle time without a command before reporting no trigger, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub trigger_timeout_ms: Option<u64>,
    /// Ask the camera for color correction.
    #[arg(long)]
    pub color_correction: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Broadcast,
    Addressed,
}

impl From<ModeArg> for TriggerMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Broadcast => TriggerMode::Broadcast,
            ModeArg::Addressed => TriggerMode::Addressed,
        }
    }
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub round: RoundArgs,
    /// Trigger topology. Default: from configuration (broadcast).
    #[arg(long, value_name = "MODE")]
    pub mode: Option<ModeArg>,
    /// Size of the generated image per device.
    #[arg(long, value_name = "BYTES", default_value = "4096", conflicts_with = "image")]
    pub payload_size: usize,
    /// Serve this file from every simulated camera instead of generated data.
    #[arg(long, value_name = "FILE")]
    pub image: Option<PathBuf>,
    /// Devices whose camera returns an empty image (comma-separated ids).
    #[arg(long, value_delimiter = ',')]
    pub empty: Vec<u32>,
    /// Largest image chunk per packet.
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn load_config(path: Option<&Path>) -> CliResult<CoordinatorConfig> {
    let Some(path) = path else {
        return Ok(CoordinatorConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| io_error(&format!("failed to read {}", path.display()), err))?;
    CoordinatorConfig::from_json(&text).map_err(|err| {
        CliError::new(
            DATA_INVALID,
            format!("invalid configuration {}: {err}", path.display()),
        )
    })
}

/// Reject configurations whose packets the coordinator would refuse.
pub fn validate_config(config: &CoordinatorConfig) -> CliResult<()> {
    config
        .validate()
        .map_err(|err| link_error("configuration rejected", err))
}

pub fn install_ctrlc_handler(on_interrupt: impl Fn() + Send + 'static) -> CliResult<()> {
    ctrlc::set_handler(on_interrupt).map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

/// Exit code for a finished round.
pub fn round_exit_code(report: &CaptureReport) -> i32 {
    if report.cancelled() {
        return INTERRUPTED;
    }
    let failed = report
        .devices
        .iter()
        .any(|d| matches!(d.outcome, DeviceOutcome::Failed(_)));
    if failed {
        FAILURE
    } else {
        SUCCESS
    }
}
