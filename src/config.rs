//! Instrument configuration.
//!
//! Everything that used to be a compile-time constant on the board lives in
//! [`InstrumentConfig`]. It is serde-friendly so a deployment can keep it in
//! a file, and the demo binary overrides individual fields from the command
//! line.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acquisition::{
    validate_channels, ChannelDescriptor, DEFAULT_CHANNELS, DEFAULT_READY_TIMEOUT,
};
use crate::ads1261::ConverterSettings;
use crate::calibration::DEFAULT_SMOOTHING_WINDOW;
use crate::errors::{DriverError, Result};
use crate::report::OutputFormat;

/// Sampling period of the acquisition task.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(10);

/// Newtons per normalized unit for a 200 kg, 2 mV/V cell at gain 128.
pub const DEFAULT_SCALE: f32 = 7_664.0;

/// Cycles between periodic status log lines.
pub const DEFAULT_STATUS_INTERVAL: u64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub converter: ConverterSettings,
    pub channels: Vec<ChannelDescriptor>,
    /// One sensitivity per channel.
    pub scales: Vec<f32>,
    /// Moving-average length; `None` or 1 disables smoothing.
    pub smoothing_window: Option<usize>,
    pub ready_timeout: Duration,
    pub period: Duration,
    pub status_interval: u64,
    /// Layout of the periodic status output.
    pub output_format: OutputFormat,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            converter: ConverterSettings::default(),
            channels: DEFAULT_CHANNELS.to_vec(),
            scales: vec![DEFAULT_SCALE; DEFAULT_CHANNELS.len()],
            smoothing_window: Some(DEFAULT_SMOOTHING_WINDOW),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            period: DEFAULT_PERIOD,
            status_interval: DEFAULT_STATUS_INTERVAL,
            output_format: OutputFormat::default(),
        }
    }
}

impl InstrumentConfig {
    /// Same scale on every configured channel.
    pub fn with_uniform_scale(mut self, scale: f32) -> Self {
        self.scales = vec![scale; self.channels.len()];
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_channels(&self.channels)?;
        if self.scales.len() != self.channels.len() {
            return Err(DriverError::invalid(format!(
                "{} scales given for {} channels",
                self.scales.len(),
                self.channels.len()
            )));
        }
        if let Some(i) = self.scales.iter().position(|s| !s.is_finite()) {
            return Err(DriverError::invalid(format!("scale for channel {i} is not finite")));
        }
        if self.smoothing_window == Some(0) {
            return Err(DriverError::invalid("smoothing window must be at least 1"));
        }
        if self.period.is_zero() {
            return Err(DriverError::invalid("sampling period must be non-zero"));
        }
        if self.ready_timeout.is_zero() {
            return Err(DriverError::invalid("ready timeout must be non-zero"));
        }
        if self.status_interval == 0 {
            return Err(DriverError::invalid("status interval must be at least 1 cycle"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads1261::{DataRate, Gain, Input, ReferenceSource};
    use crate::errors::ErrorKind;

    #[test]
    fn defaults_match_the_plate() {
        let cfg = InstrumentConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.channels.len(), 4);
        assert_eq!(cfg.converter.gain, Gain::X128);
        assert_eq!(cfg.converter.data_rate, DataRate::Sps40000);
        assert_eq!(cfg.converter.reference, ReferenceSource::AnalogSupply);
        assert_eq!(cfg.period, Duration::from_millis(10));
        assert_eq!(cfg.smoothing_window, Some(5));
        assert_eq!(cfg.output_format, OutputFormat::Log);
    }

    #[test]
    fn mismatched_scales_are_rejected() {
        let mut cfg = InstrumentConfig::default();
        cfg.scales.pop();
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn overlapping_channels_are_rejected() {
        let mut cfg = InstrumentConfig::default();
        cfg.channels[1] = ChannelDescriptor::new(Input::Ain1, Input::Ain3);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_period_is_rejected() {
        let cfg = InstrumentConfig {
            period: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn uniform_scale_follows_channel_count() {
        let mut cfg = InstrumentConfig::default();
        cfg.channels.truncate(2);
        let cfg = cfg.with_uniform_scale(2.5);
        assert_eq!(cfg.scales, vec![2.5, 2.5]);
        cfg.validate().unwrap();
    }
}
