//! Text renderings of a cycle for wired consumers.
//!
//! Two layouts are produced every status interval: a CSV row
//! `frame,timestamp_us,ch1,..,chN,total` (forces with four decimals) for
//! plotting tools reading the console, and a human-readable per-channel
//! dump for log output.

use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::calibration::MeasurementRecord;
use crate::errors::DriverError;

/// How the periodic status is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `info!` lines: summary, one line per channel, total.
    #[default]
    Log,
    /// One CSV row on stdout.
    Csv,
}

impl FromStr for OutputFormat {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" | "human" => Ok(OutputFormat::Log),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(DriverError::invalid(format!(
                "unknown output format {other:?} (expected log or csv)"
            ))),
        }
    }
}

/// Column names matching [`csv_row`] for `channels` channels.
pub fn csv_header(channels: usize) -> String {
    let mut header = String::from("frame,timestamp_us");
    for ch in 1..=channels {
        let _ = write!(header, ",ch{ch}");
    }
    header.push_str(",total");
    header
}

/// `frame,timestamp_us,f1,..,fN,total`, no trailing newline.
pub fn csv_row(frame: u64, timestamp_us: u64, forces: &[f32]) -> String {
    let mut row = format!("{frame},{timestamp_us}");
    for force in forces {
        let _ = write!(row, ",{force:.4}");
    }
    let total: f32 = forces.iter().sum();
    let _ = write!(row, ",{total:.4}");
    row
}

/// One channel of the human-readable dump. `force` is the value the packet
/// carries, which is held over when this cycle's `record` is missing.
pub fn channel_line(channel: usize, force: f32, record: Option<&MeasurementRecord>) -> String {
    match record {
        Some(r) => format!(
            "Ch{}: {:.2} N (raw={:06x}, norm={:.6})",
            channel + 1,
            force,
            r.raw as u32 & 0x00FF_FFFF,
            r.normalized
        ),
        None => format!("Ch{}: {:.2} N (no reading this cycle)", channel + 1, force),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn csv_row_has_frame_timestamp_channels_and_total() {
        let row = csv_row(200, 2_000_150, &[10.0, 20.5, -3.25, 0.0]);
        assert_eq!(row, "200,2000150,10.0000,20.5000,-3.2500,0.0000,27.2500");
        assert_eq!(row.split(',').count(), csv_header(4).split(',').count());
    }

    #[test]
    fn csv_header_names_every_channel() {
        assert_eq!(csv_header(4), "frame,timestamp_us,ch1,ch2,ch3,ch4,total");
    }

    #[test]
    fn channel_line_shows_24_bit_raw_in_hex() {
        let record = MeasurementRecord {
            channel: 0,
            raw: -1,
            normalized: -1.0 / 8_388_607.0,
            physical: -0.5,
            captured_at: Instant::now(),
        };
        assert_eq!(
            channel_line(0, -0.5, Some(&record)),
            "Ch1: -0.50 N (raw=ffffff, norm=-0.000000)"
        );
        assert_eq!(
            channel_line(3, 12.0, None),
            "Ch4: 12.00 N (no reading this cycle)"
        );
    }

    #[test]
    fn output_format_parses_names() {
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("log".parse::<OutputFormat>().unwrap(), OutputFormat::Log);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
