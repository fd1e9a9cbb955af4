//! The periodic acquisition task.
//!
//! [`Instrument`] ties the pipeline, the calibration stage and the telemetry
//! framer together. One call to [`Instrument::run_cycle`] is one tick of the
//! board's measurement loop; [`Instrument::run`] repeats it at a fixed
//! period and [`Instrument::spawn`] does so on a dedicated thread, leaving a
//! [`ControlHandle`] for the command task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use std::io::{self, Write};

use log::{debug, info, warn};

use crate::acquisition::{AcquisitionPipeline, ReadyMethod};
use crate::ads1261::Ads1261;
use crate::calibration::{Calibration, CalibrationStage, MeasurementRecord};
use crate::config::InstrumentConfig;
use crate::errors::{DriverError, ErrorKind, Result};
use crate::report::{self, OutputFormat};
use crate::telemetry::{TelemetryFramer, TelemetryPacket, TelemetrySink, TelemetryStats};
use crate::transport::Transport;

// ============================================================================
// Cycle Outcome
// ============================================================================

/// Everything one tick produced.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// 1-based cycle number.
    pub cycle: u64,
    /// Per channel; `None` where the channel failed this cycle.
    pub records: Vec<Option<MeasurementRecord>>,
    /// Failed channels and why.
    pub errors: Vec<(usize, ErrorKind)>,
    pub packet: TelemetryPacket,
    /// Whether the packet reached a subscriber.
    pub delivered: bool,
}

impl CycleOutcome {
    pub fn valid_channels(&self) -> usize {
        self.records.iter().flatten().count()
    }

    /// Sum of the forces carried by the packet.
    pub fn total_force(&self) -> f32 {
        (0..self.packet.forces.len())
            .filter_map(|ch| self.packet.force(ch))
            .sum()
    }
}

/// Summary published after every cycle for the command task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub cycles: u64,
    pub forces: Vec<f32>,
    pub channel_errors: u64,
    pub telemetry: TelemetryStats,
    pub subscribed: bool,
}

// ============================================================================
// Control Handle
// ============================================================================

/// What the command task may do while acquisition runs: tare, adjust
/// offsets and read the latest status. Cloneable.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    calibration: Calibration,
    status: Arc<Mutex<StatusSnapshot>>,
}

impl ControlHandle {
    /// Zero every channel at its latest reading. Takes effect on the next cycle.
    pub fn tare(&self) -> Result<Vec<f32>> {
        self.calibration.tare()
    }

    pub fn set_offset(&self, channel: usize, offset: f32) -> Result<()> {
        self.calibration.set_offset(channel, offset)
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// ============================================================================
// Instrument
// ============================================================================

pub struct Instrument<T, S> {
    pipeline: AcquisitionPipeline<T>,
    stage: CalibrationStage,
    framer: TelemetryFramer<S>,
    started: Instant,
    status_interval: u64,
    output_format: OutputFormat,
    csv_out: Box<dyn Write + Send>,
    channel_errors: u64,
    status: Arc<Mutex<StatusSnapshot>>,
}

impl<T: Transport, S: TelemetrySink> Instrument<T, S> {
    /// Configure the converter on `transport` and assemble the data path.
    pub fn new(
        config: &InstrumentConfig,
        transport: T,
        ready: ReadyMethod,
        sink: S,
    ) -> Result<Self> {
        config.validate()?;

        let mut adc = Ads1261::new(transport);
        let id = adc.configure(&config.converter)?;
        info!(
            "converter ready (id {:#X} rev {:#X}), {} channels, period {:?}, ready via {:?}",
            id.dev_id,
            id.rev_id,
            config.channels.len(),
            config.period,
            ready
        );

        let pipeline = AcquisitionPipeline::new(
            adc,
            config.channels.clone(),
            ready,
            config.ready_timeout,
        )?;
        let calibration = Calibration::new(config.scales.clone())?;
        let stage = CalibrationStage::new(calibration, config.smoothing_window)?;
        let mut instrument = Self::from_parts(
            pipeline,
            stage,
            TelemetryFramer::new(sink),
            config.status_interval,
        )?;
        instrument.output_format = config.output_format;
        if instrument.output_format == OutputFormat::Csv {
            instrument.write_csv(&report::csv_header(config.channels.len()));
        }
        Ok(instrument)
    }

    /// Assemble from already-built stages. The stage must calibrate exactly
    /// the channels the pipeline reads.
    pub fn from_parts(
        pipeline: AcquisitionPipeline<T>,
        stage: CalibrationStage,
        framer: TelemetryFramer<S>,
        status_interval: u64,
    ) -> Result<Self> {
        let acquired = pipeline.channels().len();
        let calibrated = stage.calibration().channel_count();
        if acquired != calibrated {
            return Err(DriverError::invalid(format!(
                "pipeline reads {acquired} channels but calibration covers {calibrated}"
            )));
        }
        Ok(Self {
            pipeline,
            stage,
            framer,
            started: Instant::now(),
            status_interval: status_interval.max(1),
            output_format: OutputFormat::default(),
            csv_out: Box::new(io::stdout()),
            channel_errors: 0,
            status: Arc::new(Mutex::new(StatusSnapshot::default())),
        })
    }

    /// Choose how the periodic status is written.
    pub fn set_output_format(&mut self, format: OutputFormat) {
        self.output_format = format;
    }

    /// Send CSV rows somewhere other than stdout.
    pub fn set_csv_writer(&mut self, out: impl Write + Send + 'static) {
        self.csv_out = Box::new(out);
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            calibration: self.stage.calibration().clone(),
            status: Arc::clone(&self.status),
        }
    }

    pub fn pipeline(&self) -> &AcquisitionPipeline<T> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut AcquisitionPipeline<T> {
        &mut self.pipeline
    }

    pub fn stage(&self) -> &CalibrationStage {
        &self.stage
    }

    pub fn framer(&self) -> &TelemetryFramer<S> {
        &self.framer
    }

    /// Acquire, calibrate, frame and notify once.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        let samples = self.pipeline.run_cycle();
        let errors: Vec<(usize, ErrorKind)> = samples
            .iter()
            .enumerate()
            .filter_map(|(ch, s)| s.as_ref().err().map(|e| (ch, e.kind())))
            .collect();
        self.channel_errors += errors.len() as u64;

        let records = self.stage.apply(&samples);
        let stamp = records
            .iter()
            .flatten()
            .map(|r| r.captured_at)
            .max()
            .unwrap_or_else(Instant::now);
        let elapsed = stamp.saturating_duration_since(self.started);
        let elapsed_ms = elapsed.as_millis() as u64;
        let packet = TelemetryPacket::from_values(elapsed_ms, &self.stage.physical_values());
        let delivered = self.framer.notify(&packet).is_ok();

        let cycle = self.pipeline.cycles();
        let outcome = CycleOutcome {
            cycle,
            records,
            errors,
            packet,
            delivered,
        };
        self.publish(&outcome);
        if cycle % self.status_interval == 0 {
            match self.output_format {
                OutputFormat::Log => self.log_status(&outcome, elapsed_ms),
                OutputFormat::Csv => {
                    let row = report::csv_row(
                        cycle,
                        elapsed.as_micros() as u64,
                        &self.stage.physical_values(),
                    );
                    self.write_csv(&row);
                }
            }
        }
        outcome
    }

    /// Run cycles every `period` until `stop` is set. Returns the number of
    /// cycles run. An overrun cycle pushes the schedule back instead of
    /// bursting to catch up.
    pub fn run(&mut self, period: Duration, stop: &AtomicBool) -> u64 {
        let mut count = 0;
        let mut next = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            self.run_cycle();
            count += 1;

            next += period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                debug!("cycle overran its {:?} period by {:?}", period, now - next);
                next = now;
            }
        }
        info!("acquisition stopped after {} cycles", count);
        count
    }

    fn publish(&self, outcome: &CycleOutcome) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        *status = StatusSnapshot {
            cycles: outcome.cycle,
            forces: self.stage.physical_values(),
            channel_errors: self.channel_errors,
            telemetry: self.framer.stats(),
            subscribed: self.framer.sink().is_subscribed(),
        };
    }

    fn log_status(&self, outcome: &CycleOutcome, elapsed_ms: u64) {
        let stats = self.framer.stats();
        let total = outcome.total_force();
        if self.framer.sink().is_subscribed() {
            info!(
                "[{} ms] cycle {}: streaming, sent {} dropped {} failed {}",
                elapsed_ms, outcome.cycle, stats.sent, stats.dropped, stats.failed
            );
        } else {
            info!(
                "[{} ms] cycle {}: waiting for subscriber",
                elapsed_ms, outcome.cycle
            );
        }
        for (ch, record) in outcome.records.iter().enumerate() {
            let force = outcome.packet.force(ch).unwrap_or_default();
            info!("  {}", report::channel_line(ch, force, record.as_ref()));
        }
        info!("  Total GRF: {:.2} N", total);
        if self.channel_errors > 0 {
            info!("channel errors so far: {}", self.channel_errors);
        }
    }

    fn write_csv(&mut self, line: &str) {
        if let Err(e) = writeln!(self.csv_out, "{line}").and_then(|()| self.csv_out.flush()) {
            warn!("csv output failed: {}", e);
        }
    }
}

impl<T, S> Instrument<T, S>
where
    T: Transport + Send + 'static,
    S: TelemetrySink + 'static,
{
    /// Move the instrument onto its own thread, sampling every `period`.
    pub fn spawn(self, period: Duration) -> Result<InstrumentHandle<T, S>> {
        let stop = Arc::new(AtomicBool::new(false));
        let control = self.control();
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || {
                let mut instrument = self;
                instrument.run(period, &flag);
                instrument
            })?;
        Ok(InstrumentHandle {
            stop,
            control,
            thread,
        })
    }
}

/// A running acquisition thread.
pub struct InstrumentHandle<T, S> {
    stop: Arc<AtomicBool>,
    control: ControlHandle,
    thread: JoinHandle<Instrument<T, S>>,
}

impl<T, S> InstrumentHandle<T, S> {
    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stop after the current cycle and hand the instrument back.
    pub fn stop(self) -> Result<Instrument<T, S>> {
        self.stop.store(true, Ordering::Relaxed);
        self.thread
            .join()
            .map_err(|_| DriverError::NotReady("acquisition thread panicked".into()))
    }
}
