//! Channel sequencing.
//!
//! One cycle visits every channel in index order:
//! select the input pair, start a conversion if the device is in pulse mode,
//! wait for the result, read it. A channel that times out or hits a bus error
//! is reported as failed and the cycle moves on to the next one.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::ads1261::{Ads1261, ConversionMode, Input};
use crate::errors::{DriverError, Result};
use crate::ready::{ReadySignal, Readiness, DEFAULT_POLL_INTERVAL};
use crate::transport::Transport;

/// Default bound on a single channel's wait for DRDY.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Channels
// ============================================================================

/// A differential input pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub positive: Input,
    pub negative: Input,
}

impl ChannelDescriptor {
    pub const fn new(positive: Input, negative: Input) -> Self {
        Self { positive, negative }
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:?}", self.positive, self.negative)
    }
}

/// The four load cells of the plate.
pub const DEFAULT_CHANNELS: [ChannelDescriptor; 4] = [
    ChannelDescriptor::new(Input::Ain0, Input::Ain1),
    ChannelDescriptor::new(Input::Ain2, Input::Ain3),
    ChannelDescriptor::new(Input::Ain4, Input::Ain5),
    ChannelDescriptor::new(Input::Ain6, Input::Ain7),
];

/// Channels must be non-empty, use two distinct inputs each and share no
/// input with any other channel.
pub fn validate_channels(channels: &[ChannelDescriptor]) -> Result<()> {
    if channels.is_empty() {
        return Err(DriverError::invalid("at least one channel is required"));
    }
    let mut used: Vec<Input> = Vec::with_capacity(channels.len() * 2);
    for (i, ch) in channels.iter().enumerate() {
        if ch.positive == ch.negative {
            return Err(DriverError::invalid(format!(
                "channel {i} ({ch}) uses the same input twice"
            )));
        }
        for input in [ch.positive, ch.negative] {
            if used.contains(&input) {
                return Err(DriverError::invalid(format!(
                    "channel {i} ({ch}) overlaps another channel on {input:?}"
                )));
            }
            used.push(input);
        }
    }
    Ok(())
}

// ============================================================================
// Readiness
// ============================================================================

/// How AWAIT_READY observes a finished conversion.
pub enum ReadyMethod {
    /// A ready line, interrupt-driven or polled.
    Line(Box<dyn ReadySignal>),
    /// Poll STATUS.DRDY over the bus.
    StatusRegister { poll_interval: Duration },
}

impl ReadyMethod {
    pub fn status_register() -> Self {
        ReadyMethod::StatusRegister {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Use `line` when present, otherwise fall back to the status register.
    pub fn line_or_status(line: Option<Box<dyn ReadySignal>>) -> Self {
        match line {
            Some(line) => ReadyMethod::Line(line),
            None => ReadyMethod::status_register(),
        }
    }
}

impl fmt::Debug for ReadyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyMethod::Line(_) => f.write_str("Line"),
            ReadyMethod::StatusRegister { poll_interval } => f
                .debug_struct("StatusRegister")
                .field("poll_interval", poll_interval)
                .finish(),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Where the pipeline is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    SelectChannel(usize),
    Start(usize),
    AwaitReady(usize),
    Read(usize),
    CycleComplete,
}

/// A decoded conversion result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub channel: usize,
    pub value: i32,
    /// Taken right after the data read.
    pub captured_at: Instant,
}

/// Per-channel results of one cycle, in channel order.
pub type CycleSamples = Vec<Result<RawSample>>;

pub struct AcquisitionPipeline<T> {
    adc: Ads1261<T>,
    channels: Vec<ChannelDescriptor>,
    ready: ReadyMethod,
    ready_timeout: Duration,
    state: CycleState,
    cycles: u64,
}

impl<T: Transport> AcquisitionPipeline<T> {
    /// `adc` should already be configured.
    pub fn new(
        adc: Ads1261<T>,
        channels: Vec<ChannelDescriptor>,
        ready: ReadyMethod,
        ready_timeout: Duration,
    ) -> Result<Self> {
        validate_channels(&channels)?;
        Ok(Self {
            adc,
            channels,
            ready,
            ready_timeout,
            state: CycleState::Idle,
            cycles: 0,
        })
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn adc(&self) -> &Ads1261<T> {
        &self.adc
    }

    pub fn adc_mut(&mut self) -> &mut Ads1261<T> {
        &mut self.adc
    }

    pub fn into_adc(self) -> Ads1261<T> {
        self.adc
    }

    /// Visit every channel once. Never fails as a whole; each slot carries
    /// that channel's sample or error.
    pub fn run_cycle(&mut self) -> CycleSamples {
        let samples: CycleSamples = (0..self.channels.len())
            .map(|index| {
                let result = self.acquire_channel(index);
                if let Err(e) = &result {
                    warn!("channel {} ({}): {}", index, self.channels[index], e);
                }
                result
            })
            .collect();
        self.enter(CycleState::CycleComplete);
        self.cycles += 1;
        self.enter(CycleState::Idle);
        samples
    }

    fn acquire_channel(&mut self, index: usize) -> Result<RawSample> {
        let channel = self.channels[index];

        self.enter(CycleState::SelectChannel(index));
        self.adc.set_multiplexer(channel.positive, channel.negative)?;
        if let ReadyMethod::Line(line) = &mut self.ready {
            line.clear();
        }

        if self.adc.conversion_mode() == ConversionMode::Pulse {
            self.enter(CycleState::Start(index));
            self.adc.start_conversion()?;
        }

        self.enter(CycleState::AwaitReady(index));
        if self.await_ready()? == Readiness::TimedOut {
            return Err(DriverError::Timeout(format!(
                "no data ready on channel {} within {:?}",
                index, self.ready_timeout
            )));
        }

        self.enter(CycleState::Read(index));
        let value = self.adc.read_conversion_data()?;
        Ok(RawSample {
            channel: index,
            value,
            captured_at: Instant::now(),
        })
    }

    fn await_ready(&mut self) -> Result<Readiness> {
        match &mut self.ready {
            ReadyMethod::Line(line) => line.await_ready(self.ready_timeout),
            ReadyMethod::StatusRegister { poll_interval } => {
                let deadline = Instant::now() + self.ready_timeout;
                loop {
                    if self.adc.read_status()?.data_ready() {
                        return Ok(Readiness::Ready);
                    }
                    if Instant::now() >= deadline {
                        return Ok(Readiness::TimedOut);
                    }
                    thread::sleep(*poll_interval);
                }
            }
        }
    }

    fn enter(&mut self, next: CycleState) {
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads1261::{ConverterSettings, InputMux};
    use crate::errors::ErrorKind;
    use crate::sim::SimulatedAdc;

    fn settings() -> ConverterSettings {
        ConverterSettings {
            reset_settle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn pipeline(sim: &SimulatedAdc, mode: ConversionMode) -> AcquisitionPipeline<SimulatedAdc> {
        let mut adc = Ads1261::new(sim.clone());
        adc.configure(&ConverterSettings {
            conversion_mode: mode,
            ..settings()
        })
        .unwrap();
        AcquisitionPipeline::new(
            adc,
            DEFAULT_CHANNELS.to_vec(),
            ReadyMethod::StatusRegister {
                poll_interval: Duration::from_micros(50),
            },
            Duration::from_millis(5),
        )
        .unwrap()
    }

    #[test]
    fn default_channels_are_disjoint() {
        validate_channels(&DEFAULT_CHANNELS).unwrap();
    }

    #[test]
    fn overlapping_channels_are_rejected() {
        let channels = [
            ChannelDescriptor::new(Input::Ain0, Input::Ain1),
            ChannelDescriptor::new(Input::Ain1, Input::Ain2),
        ];
        let err = validate_channels(&channels).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(validate_channels(&[]).is_err());
        assert!(validate_channels(&[ChannelDescriptor::new(Input::Ain3, Input::Ain3)]).is_err());
    }

    #[test]
    fn channel_order_is_fixed_across_cycles() {
        let sim = SimulatedAdc::new();
        let mut pipe = pipeline(&sim, ConversionMode::Continuous);
        sim.clear_mux_log();

        for _ in 0..10 {
            let samples = pipe.run_cycle();
            assert!(samples.iter().all(|s| s.is_ok()));
            assert_eq!(pipe.state(), CycleState::Idle);
        }

        let expected: Vec<u8> = DEFAULT_CHANNELS
            .iter()
            .map(|c| {
                InputMux {
                    positive: c.positive,
                    negative: c.negative,
                }
                .encode()
            })
            .collect();
        let log = sim.mux_log();
        assert_eq!(log.len(), 40);
        for cycle in log.chunks(4) {
            assert_eq!(cycle, expected.as_slice());
        }
        assert_eq!(pipe.cycles(), 10);
    }

    #[test]
    fn timeout_on_one_channel_does_not_block_others() {
        let sim = SimulatedAdc::new();
        sim.set_raw(DEFAULT_CHANNELS[0], 100);
        sim.set_raw(DEFAULT_CHANNELS[1], -200);
        sim.set_raw(DEFAULT_CHANNELS[3], 400);
        sim.stall(DEFAULT_CHANNELS[2], true);
        let mut pipe = pipeline(&sim, ConversionMode::Continuous);

        let samples = pipe.run_cycle();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].as_ref().unwrap().value, 100);
        assert_eq!(samples[1].as_ref().unwrap().value, -200);
        assert_eq!(
            samples[2].as_ref().unwrap_err().kind(),
            ErrorKind::Timeout
        );
        assert_eq!(samples[3].as_ref().unwrap().value, 400);
        assert_eq!(samples[3].as_ref().unwrap().channel, 3);
    }

    #[test]
    fn transport_fault_is_channel_scoped() {
        let sim = SimulatedAdc::new();
        sim.set_raw(DEFAULT_CHANNELS[1], 7);
        let mut pipe = pipeline(&sim, ConversionMode::Continuous);

        sim.fail_next_exchange();
        let samples = pipe.run_cycle();
        assert_eq!(
            samples[0].as_ref().unwrap_err().kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(samples[1].as_ref().unwrap().value, 7);
        assert!(!sim.is_selected());
    }

    #[test]
    fn pulse_mode_starts_each_conversion() {
        let sim = SimulatedAdc::new();
        let mut pipe = pipeline(&sim, ConversionMode::Pulse);
        let starts_before = sim.start_count();
        let samples = pipe.run_cycle();
        assert!(samples.iter().all(|s| s.is_ok()));
        assert_eq!(sim.start_count() - starts_before, 4);
    }

    #[test]
    fn line_method_uses_signal() {
        let sim = SimulatedAdc::new();
        sim.set_raw(DEFAULT_CHANNELS[0], -1);
        let mut adc = Ads1261::new(sim.clone());
        adc.configure(&settings()).unwrap();
        let line: Box<dyn ReadySignal> = Box::new(crate::ready::PolledPin::with_interval(
            sim.drdy_pin(),
            Duration::from_micros(50),
        ));
        let mut pipe = AcquisitionPipeline::new(
            adc,
            DEFAULT_CHANNELS.to_vec(),
            ReadyMethod::line_or_status(Some(line)),
            Duration::from_millis(5),
        )
        .unwrap();
        let samples = pipe.run_cycle();
        assert_eq!(samples[0].as_ref().unwrap().value, -1);
    }
}
