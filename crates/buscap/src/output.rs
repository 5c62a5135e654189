use std::io::IsTerminal;

use buscap_link::{CaptureReport, DeviceOutcome, DeviceReport};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReportOutput<'a> {
    session: String,
    mode: String,
    saved: usize,
    devices: Vec<DeviceOutput<'a>>,
}

#[derive(Serialize)]
struct DeviceOutput<'a> {
    device: u32,
    address: String,
    outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    packets: Option<usize>,
    #[serde(skip_serializing_if = "no_indices")]
    gaps: &'a [u16],
    #[serde(skip_serializing_if = "no_indices")]
    skipped: &'a [u16],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn no_indices(indices: &&[u16]) -> bool {
    indices.is_empty()
}

impl<'a> From<&'a DeviceReport> for DeviceOutput<'a> {
    fn from(report: &'a DeviceReport) -> Self {
        let mut out = DeviceOutput {
            device: report.device,
            address: report.address.to_string(),
            outcome: report.outcome.label(),
            path: None,
            bytes: None,
            packets: None,
            gaps: &[],
            skipped: &[],
            error: None,
        };
        match &report.outcome {
            DeviceOutcome::Saved {
                path,
                bytes,
                packets,
                gaps,
                skipped,
            } => {
                out.path = Some(path.display().to_string());
                out.bytes = Some(*bytes);
                out.packets = Some(*packets);
                out.gaps = gaps.as_slice();
                out.skipped = skipped.as_slice();
            }
            DeviceOutcome::Failed(err) => out.error = Some(err.to_string()),
            DeviceOutcome::NoImage | DeviceOutcome::Cancelled => {}
        }
        out
    }
}

pub fn print_report(report: &CaptureReport, format: OutputFormat) {
    let devices: Vec<DeviceOutput<'_>> = report.devices.iter().map(DeviceOutput::from).collect();

    match format {
        OutputFormat::Json => {
            let out = ReportOutput {
                session: report.session.to_rfc3339(),
                mode: report.mode.to_string(),
                saved: report.saved(),
                devices,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["DEVICE", "ADDRESS", "OUTCOME", "BYTES", "DETAIL"]);
            for device in &devices {
                table.add_row(vec![
                    device.device.to_string(),
                    device.address.clone(),
                    device.outcome.to_string(),
                    device.bytes.map(|b| b.to_string()).unwrap_or_default(),
                    detail(device),
                ]);
            }
            println!("{table}");
            println!(
                "session {} ({} trigger): {}/{} saved",
                report.session.format("%Y-%m-%d %H:%M:%S"),
                report.mode,
                report.saved(),
                devices.len()
            );
        }
        OutputFormat::Pretty => {
            for device in &devices {
                println!(
                    "device={} address={} outcome={} {}",
                    device.device,
                    device.address,
                    device.outcome,
                    detail(device)
                );
            }
        }
    }
}

fn detail(device: &DeviceOutput<'_>) -> String {
    if let Some(error) = &device.error {
        return error.clone();
    }
    let mut parts = Vec::new();
    if let Some(path) = &device.path {
        parts.push(path.clone());
    }
    if !device.gaps.is_empty() {
        parts.push(format!("gaps={:?}", device.gaps));
    }
    if !device.skipped.is_empty() {
        parts.push(format!("skipped={:?}", device.skipped));
    }
    parts.join(" ")
}
