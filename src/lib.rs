//! Force-plate telemetry pipeline for the TI ADS1261.
//!
//! This crate drives a 24-bit ADS1261 over any synchronous serial transport,
//! samples four load-cell bridges in a fixed round-robin, converts the raw
//! counts to force and streams fixed-size packets to a wireless subscriber.
//!
//! # Data path
//!
//! ```text
//! Ads1261 -> AcquisitionPipeline -> CalibrationStage -> TelemetryFramer -> sink
//! ```
//!
//! [`instrument::Instrument`] runs that path once per period on its own
//! thread; a [`instrument::ControlHandle`] lets another task tare the plate
//! while it runs.
//!
//! # Timing
//!
//! The packet timestamp is the time of the last successful data read of the
//! cycle, in milliseconds since the instrument was built, truncated to 16
//! bits. Consumers should unwrap it against their own clock.
//!
//! # Features
//!
//! - `bluez`: BLE GATT sink ([`bluetooth::BlePeripheral`]) through BlueZ.

pub mod acquisition;
pub mod ads1261;
#[cfg(feature = "bluez")]
pub mod bluetooth;
pub mod calibration;
pub mod config;
pub mod errors;
pub mod instrument;
pub mod logging;
pub mod ready;
pub mod report;
pub mod sim;
pub mod telemetry;
pub mod transport;

pub use acquisition::{
    AcquisitionPipeline, ChannelDescriptor, CycleState, RawSample, ReadyMethod, DEFAULT_CHANNELS,
};
pub use ads1261::{
    sign_extend_24, Ads1261, ConversionMode, ConverterSettings, DataRate, Filter, Gain, Input,
    ReferenceSource, Register,
};
#[cfg(feature = "bluez")]
pub use bluetooth::{BlePeripheral, BleServer, BleSink};
pub use calibration::{Calibration, CalibrationStage, MeasurementRecord, MovingAverage};
pub use config::InstrumentConfig;
pub use errors::*;
pub use instrument::{ControlHandle, CycleOutcome, Instrument, InstrumentHandle, StatusSnapshot};
pub use ready::{DrdySemaphore, PolledPin, ReadySignal, Readiness};
pub use report::OutputFormat;
pub use telemetry::{LoggingSink, SubscriberState, TelemetryFramer, TelemetryPacket, TelemetrySink};
pub use transport::{HalTransport, Transport};
