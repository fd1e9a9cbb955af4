//! Raw counts to physical units.
//!
//! `physical = (raw / FULL_SCALE - offset) * scale`, optionally smoothed by a
//! per-channel moving average. The offset is the tare point in normalized
//! units; the scale is the channel's sensitivity from an offline calibration
//! against a known load.
//!
//! [`Calibration`] is the state shared with the command task. It is cheap to
//! clone and every clone sees the same offsets.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, info, warn};

use crate::acquisition::RawSample;
use crate::ads1261;
use crate::errors::{DriverError, Result};

/// Normalization divisor: the largest positive 24-bit sample.
pub const FULL_SCALE: f32 = ads1261::FULL_SCALE as f32;

pub const DEFAULT_SMOOTHING_WINDOW: usize = 5;

/// Ratiometric reading in [-1, 1).
#[inline]
pub fn normalize(raw: i32) -> f32 {
    raw as f32 / FULL_SCALE
}

// ============================================================================
// Moving Average
// ============================================================================

/// Fixed-window FIFO average with an incrementally maintained sum.
///
/// Until the window fills, the average is taken over the samples seen so far:
/// feeding `[1, 2, 3, 4, 5, 6]` into a window of 5 reports
/// `[1, 1.5, 2, 2.5, 3, 4]`.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    buf: Vec<f32>,
    head: usize,
    len: usize,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Result<Self> {
        if window == 0 {
            return Err(DriverError::invalid("moving average window must be at least 1"));
        }
        Ok(Self {
            buf: vec![0.0; window],
            head: 0,
            len: 0,
            sum: 0.0,
        })
    }

    /// Insert `value`, evicting the oldest when full, and return the new average.
    pub fn push(&mut self, value: f32) -> f32 {
        if self.len == self.buf.len() {
            self.sum -= self.buf[self.head] as f64;
        } else {
            self.len += 1;
        }
        self.buf[self.head] = value;
        self.sum += value as f64;
        self.head = (self.head + 1) % self.buf.len();
        self.average()
    }

    pub fn average(&self) -> f32 {
        if self.len == 0 {
            0.0
        } else {
            (self.sum / self.len as f64) as f32
        }
    }

    pub fn window(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.sum = 0.0;
    }
}

// ============================================================================
// Shared Calibration State
// ============================================================================

#[derive(Debug)]
struct CalibrationState {
    offsets: Vec<f32>,
    scales: Vec<f32>,
    /// Most recent normalized reading per channel, before offset.
    latest: Vec<Option<f32>>,
    generation: u64,
}

/// Offsets and scales, shared between the acquisition and command tasks.
#[derive(Debug, Clone)]
pub struct Calibration {
    inner: Arc<Mutex<CalibrationState>>,
}

impl Calibration {
    /// One scale per channel; offsets start at zero.
    pub fn new(scales: Vec<f32>) -> Result<Self> {
        if scales.is_empty() {
            return Err(DriverError::invalid("at least one channel scale is required"));
        }
        if let Some(i) = scales.iter().position(|s| !s.is_finite()) {
            return Err(DriverError::invalid(format!(
                "scale for channel {i} is not finite"
            )));
        }
        let n = scales.len();
        Ok(Self {
            inner: Arc::new(Mutex::new(CalibrationState {
                offsets: vec![0.0; n],
                scales,
                latest: vec![None; n],
                generation: 0,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CalibrationState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channel_count(&self) -> usize {
        self.lock().scales.len()
    }

    /// Take the most recent reading of every channel as its new zero.
    ///
    /// Channels that have never produced a sample keep their offset. Fails
    /// with `NotReady` when no channel has a reading yet.
    pub fn tare(&self) -> Result<Vec<f32>> {
        let mut state = self.lock();
        if state.latest.iter().all(Option::is_none) {
            return Err(DriverError::NotReady("no reading to tare against yet".into()));
        }
        let CalibrationState {
            offsets,
            latest,
            generation,
            ..
        } = &mut *state;
        for (ch, (offset, reading)) in offsets.iter_mut().zip(latest.iter()).enumerate() {
            match reading {
                Some(value) => *offset = *value,
                None => warn!("tare: channel {} has no reading, offset unchanged", ch),
            }
        }
        *generation += 1;
        info!("tare applied: offsets {:?}", offsets);
        Ok(offsets.clone())
    }

    pub fn set_offset(&self, channel: usize, offset: f32) -> Result<()> {
        if !offset.is_finite() {
            return Err(DriverError::invalid(format!("offset {offset} is not finite")));
        }
        let mut state = self.lock();
        let slot = state
            .offsets
            .get_mut(channel)
            .ok_or_else(|| channel_error(channel))?;
        *slot = offset;
        state.generation += 1;
        debug!("channel {} offset set to {:.6}", channel, offset);
        Ok(())
    }

    pub fn offset(&self, channel: usize) -> Result<f32> {
        self.lock()
            .offsets
            .get(channel)
            .copied()
            .ok_or_else(|| channel_error(channel))
    }

    pub fn scale(&self, channel: usize) -> Result<f32> {
        self.lock()
            .scales
            .get(channel)
            .copied()
            .ok_or_else(|| channel_error(channel))
    }

    pub fn offsets(&self) -> Vec<f32> {
        self.lock().offsets.clone()
    }

    /// Bumped on every tare or manual offset change.
    pub fn tare_generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether a tare or manual offset has been applied since startup.
    pub fn is_zeroed(&self) -> bool {
        self.tare_generation() > 0
    }
}

fn channel_error(channel: usize) -> DriverError {
    DriverError::invalid(format!("no channel {channel}"))
}

// ============================================================================
// Calibration Stage
// ============================================================================

/// Calibrated reading of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRecord {
    pub channel: usize,
    pub raw: i32,
    /// `raw / FULL_SCALE`, before tare.
    pub normalized: f32,
    /// Tared, scaled and, when enabled, smoothed.
    pub physical: f32,
    pub captured_at: Instant,
}

/// Runs on the acquisition task; owns the filters and the latest record per channel.
pub struct CalibrationStage {
    calibration: Calibration,
    filters: Option<Vec<MovingAverage>>,
    seen_generation: u64,
    latest: Vec<Option<MeasurementRecord>>,
}

impl CalibrationStage {
    /// `smoothing_window` of `None` or `Some(1)` disables smoothing.
    pub fn new(calibration: Calibration, smoothing_window: Option<usize>) -> Result<Self> {
        let n = calibration.channel_count();
        let filters = match smoothing_window {
            Some(w) if w > 1 => Some(
                (0..n)
                    .map(|_| MovingAverage::new(w))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Some(0) => return Err(DriverError::invalid("smoothing window must be at least 1")),
            _ => None,
        };
        let seen_generation = calibration.tare_generation();
        Ok(Self {
            calibration,
            filters,
            seen_generation,
            latest: vec![None; n],
        })
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Calibrate one cycle. Failed channels yield `None` and keep their
    /// previous record in [`Self::latest`].
    pub fn apply(&mut self, samples: &[Result<RawSample>]) -> Vec<Option<MeasurementRecord>> {
        let (offsets, scales, generation) = {
            let mut state = self.calibration.lock();
            for sample in samples.iter().flatten() {
                if let Some(slot) = state.latest.get_mut(sample.channel) {
                    *slot = Some(normalize(sample.value));
                }
            }
            (state.offsets.clone(), state.scales.clone(), state.generation)
        };

        if generation != self.seen_generation {
            if let Some(filters) = &mut self.filters {
                filters.iter_mut().for_each(MovingAverage::clear);
            }
            self.seen_generation = generation;
        }

        let mut records = vec![None; self.latest.len()];
        for sample in samples.iter().flatten() {
            let ch = sample.channel;
            if ch >= self.latest.len() {
                warn!("sample for unknown channel {} ignored", ch);
                continue;
            }
            let normalized = normalize(sample.value);
            let mut physical = (normalized - offsets[ch]) * scales[ch];
            if let Some(filters) = &mut self.filters {
                physical = filters[ch].push(physical);
            }
            let record = MeasurementRecord {
                channel: ch,
                raw: sample.value,
                normalized,
                physical,
                captured_at: sample.captured_at,
            };
            self.latest[ch] = Some(record);
            records[ch] = Some(record);
        }
        records
    }

    pub fn latest(&self) -> &[Option<MeasurementRecord>] {
        &self.latest
    }

    /// Latest physical value per channel; zero for channels never read.
    pub fn physical_values(&self) -> Vec<f32> {
        self.latest
            .iter()
            .map(|r| r.map_or(0.0, |r| r.physical))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(channel: usize, value: i32) -> Result<RawSample> {
        Ok(RawSample {
            channel,
            value,
            captured_at: Instant::now(),
        })
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn moving_average_over_available_samples() {
        let mut avg = MovingAverage::new(5).unwrap();
        let out: Vec<f32> = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .map(|&v| avg.push(v))
            .collect();
        assert_eq!(out, vec![1.0, 1.5, 2.0, 2.5, 3.0, 4.0]);
        assert!(avg.is_full());
    }

    #[test]
    fn moving_average_clear_restarts_warmup() {
        let mut avg = MovingAverage::new(3).unwrap();
        avg.push(10.0);
        avg.push(20.0);
        avg.clear();
        assert!(avg.is_empty());
        assert_eq!(avg.push(4.0), 4.0);
        assert!(MovingAverage::new(0).is_err());
    }

    #[test]
    fn full_scale_normalizes_to_one() {
        assert!(approx(normalize(8_388_607), 1.0));
        assert!(approx(normalize(-8_388_608), -1.0));
        assert_eq!(normalize(0), 0.0);
    }

    #[test]
    fn tare_zeroes_the_same_reading() {
        let cal = Calibration::new(vec![1000.0; 4]).unwrap();
        let mut stage = CalibrationStage::new(cal.clone(), None).unwrap();
        let cycle = vec![
            sample(0, 123_456),
            sample(1, -54_321),
            sample(2, 1),
            sample(3, 8_000_000),
        ];

        let before = stage.apply(&cycle);
        assert!(before[0].unwrap().physical > 0.0);

        cal.tare().unwrap();
        let after = stage.apply(&cycle);
        for record in after.iter().flatten() {
            assert!(approx(record.physical, 0.0), "{record:?}");
        }
        assert_eq!(cal.tare_generation(), 1);
    }

    #[test]
    fn tare_resets_smoothing() {
        let cal = Calibration::new(vec![500.0]).unwrap();
        let mut stage = CalibrationStage::new(cal.clone(), Some(5)).unwrap();
        stage.apply(&[sample(0, 0)]);
        stage.apply(&[sample(0, 100_000)]);
        cal.tare().unwrap();
        let rec = stage.apply(&[sample(0, 100_000)])[0].unwrap();
        assert!(approx(rec.physical, 0.0));
    }

    #[test]
    fn scale_and_offset_apply_in_order() {
        let cal = Calibration::new(vec![2000.0, 2000.0]).unwrap();
        cal.set_offset(1, 0.25).unwrap();
        let mut stage = CalibrationStage::new(cal.clone(), None).unwrap();
        let half = (FULL_SCALE / 2.0) as i32;
        let out = stage.apply(&[sample(0, half), sample(1, half)]);
        assert!((out[0].unwrap().physical - 1000.0).abs() < 0.01);
        assert!((out[1].unwrap().physical - 500.0).abs() < 0.01);
        assert_eq!(cal.offset(1).unwrap(), 0.25);
        assert_eq!(cal.scale(0).unwrap(), 2000.0);
    }

    #[test]
    fn failed_channel_keeps_previous_record() {
        let cal = Calibration::new(vec![1.0, 1.0]).unwrap();
        let mut stage = CalibrationStage::new(cal, None).unwrap();
        stage.apply(&[sample(0, 10), sample(1, 20)]);
        let out = stage.apply(&[
            sample(0, 30),
            Err(DriverError::Timeout("channel 1".into())),
        ]);
        assert!(out[1].is_none());
        assert_eq!(stage.latest()[1].unwrap().raw, 20);
        assert_eq!(stage.latest()[0].unwrap().raw, 30);
    }

    #[test]
    fn tare_before_any_reading_is_not_ready() {
        let cal = Calibration::new(vec![1.0]).unwrap();
        assert!(matches!(cal.tare(), Err(DriverError::NotReady(_))));
        assert!(!cal.is_zeroed());
    }

    #[test]
    fn bad_channel_and_values_are_rejected() {
        let cal = Calibration::new(vec![1.0; 2]).unwrap();
        assert!(cal.set_offset(2, 0.0).is_err());
        assert!(cal.set_offset(0, f32::NAN).is_err());
        assert!(cal.scale(5).is_err());
        assert!(Calibration::new(vec![]).is_err());
        assert!(Calibration::new(vec![f32::INFINITY]).is_err());
    }
}
