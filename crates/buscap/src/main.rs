mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "buscap", version, about = "Multi-camera capture over a shared serial bus")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::ModeArg;

    #[test]
    fn parses_capture_subcommand() {
        let cli = Cli::try_parse_from([
            "buscap",
            "capture",
            "--devices",
            "1,3",
            "--socket-dir",
            "/tmp/bus",
            "--settle-ms",
            "500",
        ])
        .expect("capture args should parse");

        let Command::Capture(args) = cli.command else {
            panic!("expected capture command");
        };
        assert_eq!(args.round.devices, Some(vec![1, 3]));
        assert_eq!(args.round.settle_ms, Some(500));
        assert_eq!(args.socket_dir, std::path::PathBuf::from("/tmp/bus"));
    }

    #[test]
    fn parses_simulate_with_mode() {
        let cli = Cli::try_parse_from([
            "buscap",
            "--format",
            "json",
            "simulate",
            "--mode",
            "addressed",
            "--empty",
            "2,4",
        ])
        .expect("simulate args should parse");

        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate command");
        };
        assert_eq!(args.mode, Some(ModeArg::Addressed));
        assert_eq!(args.empty, vec![2, 4]);
        assert_eq!(args.payload_size, 4096);
    }

    #[test]
    fn rejects_unknown_trigger_mode() {
        let err = Cli::try_parse_from(["buscap", "simulate", "--mode", "mixed"])
            .expect_err("unknown mode should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn rejects_image_with_payload_size() {
        let err = Cli::try_parse_from([
            "buscap",
            "simulate",
            "--image",
            "/tmp/x.jpg",
            "--payload-size",
            "10",
        ])
        .expect_err("conflicting args should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn peripheral_requires_id_and_image() {
        let err = Cli::try_parse_from(["buscap", "peripheral", "--id", "1"])
            .expect_err("missing image should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
