//! ADS1261 precision ADC driver.
//!
//! This module speaks the converter's command/register protocol over any
//! [`Transport`]. It knows the register map, the bit layout of each
//! configuration register and the framing of every command; it does not
//! know about channels, calibration or scheduling.
//!
//! # Framing
//!
//! Every command is one select boundary. Inside it each byte (or byte group)
//! is a separate exchange on the bus:
//!
//! - `RESET`, `START`, `STOP`: one opcode byte
//! - `RREG`: opcode | address, one dummy byte, one data byte clocked in
//! - `WREG`: opcode | address, then the value byte
//! - `RDATA`: opcode, then three data bytes clocked in MSB first
//!
//! `RDATA` assumes the status and CRC bytes are disabled (MODE3 STATENB and
//! CRCENB at their reset value of 0).

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::transport::{Selected, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Delay the device needs after `RESET` before it accepts further commands.
pub const RESET_SETTLE: Duration = Duration::from_millis(100);

/// Upper nibble of the ID register for this part.
pub const EXPECTED_DEV_ID: u8 = 0x8;

/// Largest positive 24-bit two's-complement value.
pub const FULL_SCALE: i32 = 0x7F_FFFF;

mod cmd {
    pub const RESET: u8 = 0x06;
    pub const START: u8 = 0x08;
    pub const STOP: u8 = 0x0A;
    pub const RDATA: u8 = 0x12;
    pub const RREG: u8 = 0x20;
    pub const WREG: u8 = 0x40;
}

/// Filler byte clocked out while the device answers a read.
const DUMMY: u8 = 0x00;

// ============================================================================
// Register Map
// ============================================================================

/// Addressable configuration registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    Id = 0x00,
    Status = 0x01,
    Mode0 = 0x02,
    Mode1 = 0x03,
    Mode2 = 0x04,
    Mode3 = 0x05,
    Ref = 0x06,
    Ofcal0 = 0x07,
    Ofcal1 = 0x08,
    Ofcal2 = 0x09,
    Fscal0 = 0x0A,
    Fscal1 = 0x0B,
    Fscal2 = 0x0C,
    Imux = 0x0D,
    Imag = 0x0E,
    Reserved = 0x0F,
    Pga = 0x10,
    Inpmux = 0x11,
    Inpbias = 0x12,
}

impl Register {
    pub const ALL: [Register; 19] = [
        Register::Id,
        Register::Status,
        Register::Mode0,
        Register::Mode1,
        Register::Mode2,
        Register::Mode3,
        Register::Ref,
        Register::Ofcal0,
        Register::Ofcal1,
        Register::Ofcal2,
        Register::Fscal0,
        Register::Fscal1,
        Register::Fscal2,
        Register::Imux,
        Register::Imag,
        Register::Reserved,
        Register::Pga,
        Register::Inpmux,
        Register::Inpbias,
    ];

    pub fn addr(self) -> u8 {
        self as u8
    }

    /// Power-on value. ID reports only the family nibble here; the
    /// revision nibble varies by silicon.
    pub fn reset_value(self) -> u8 {
        match self {
            Register::Id => EXPECTED_DEV_ID << 4,
            Register::Status => status::RESET,
            Register::Mode0 => 0x24,
            Register::Mode1 => 0x01,
            Register::Ref => 0x05,
            Register::Fscal2 => 0x40,
            Register::Imux | Register::Inpmux => 0xFF,
            _ => 0x00,
        }
    }

    /// ID is read-only and the reserved slot must never be written.
    pub fn is_writable(self) -> bool {
        !matches!(self, Register::Id | Register::Reserved)
    }
}

impl TryFrom<u8> for Register {
    type Error = DriverError;

    fn try_from(addr: u8) -> Result<Self> {
        Register::ALL
            .get(addr as usize)
            .copied()
            .ok_or_else(|| DriverError::invalid(format!("no register at address {addr:#04X}")))
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:#04X}", self, self.addr())
    }
}

/// STATUS register bits.
pub mod status {
    pub const RESET: u8 = 1 << 0;
    pub const CLOCK: u8 = 1 << 1;
    pub const DRDY: u8 = 1 << 2;
    pub const REFL_ALM: u8 = 1 << 3;
    pub const PGAH_ALM: u8 = 1 << 4;
    pub const PGAL_ALM: u8 = 1 << 5;
    pub const CRCERR: u8 = 1 << 6;
    pub const LOCK: u8 = 1 << 7;
}

const ID_DEV_SHIFT: u8 = 4;
const ID_REV_MASK: u8 = 0x0F;

const MODE0_DR_SHIFT: u8 = 3;
const MODE0_DR_MASK: u8 = 0b1111_1000;
const MODE0_FILTER_MASK: u8 = 0b0000_0111;

const MODE1_CHOP_SHIFT: u8 = 5;
const MODE1_CHOP_MASK: u8 = 0b0110_0000;
const MODE1_CONVRT_SHIFT: u8 = 4;
const MODE1_CONVRT_MASK: u8 = 0b0001_0000;
const MODE1_DELAY_MASK: u8 = 0b0000_1111;

const REF_REFENB: u8 = 1 << 4;
const REF_RMUXP_SHIFT: u8 = 2;
const REF_RMUXP_MASK: u8 = 0b0000_1100;
const REF_RMUXN_MASK: u8 = 0b0000_0011;

const PGA_BYPASS: u8 = 1 << 7;
const PGA_GAIN_MASK: u8 = 0b0000_0111;

const INPMUX_MUXP_SHIFT: u8 = 4;
const INPMUX_MUXN_MASK: u8 = 0x0F;

// ============================================================================
// Enumerated Settings
// ============================================================================

macro_rules! code_enum {
    ($name:ident, $what:literal, [$($variant:ident),+ $(,)?]) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(self) -> u8 {
                self as u8
            }
        }

        impl TryFrom<u8> for $name {
            type Error = DriverError;

            fn try_from(code: u8) -> Result<Self> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.code() == code)
                    .ok_or_else(|| {
                        DriverError::invalid(format!("{} code {code:#04X} is not defined", $what))
                    })
            }
        }
    };
}

/// PGA gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Gain {
    X1 = 0,
    X2 = 1,
    X4 = 2,
    X8 = 3,
    X16 = 4,
    X32 = 5,
    X64 = 6,
    #[default]
    X128 = 7,
}
code_enum!(Gain, "gain", [X1, X2, X4, X8, X16, X32, X64, X128]);

impl Gain {
    pub fn multiplier(self) -> u16 {
        1 << self.code()
    }

    /// Parse a multiplier such as `128`.
    pub fn from_multiplier(value: u16) -> Result<Self> {
        Gain::ALL
            .iter()
            .copied()
            .find(|g| g.multiplier() == value)
            .ok_or_else(|| {
                DriverError::invalid(format!(
                    "unsupported gain {value}. Supported: 1, 2, 4, 8, 16, 32, 64, 128"
                ))
            })
    }
}

/// Output data rate (MODE0.DR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataRate {
    Sps2_5 = 0x00,
    Sps5 = 0x01,
    Sps10 = 0x02,
    Sps16_6 = 0x03,
    Sps20 = 0x04,
    Sps50 = 0x05,
    Sps60 = 0x06,
    Sps100 = 0x07,
    Sps400 = 0x08,
    Sps1200 = 0x09,
    Sps2400 = 0x0A,
    Sps4800 = 0x0B,
    Sps7200 = 0x0C,
    Sps14400 = 0x0D,
    Sps19200 = 0x0E,
    Sps25600 = 0x0F,
    #[default]
    Sps40000 = 0x10,
}
code_enum!(
    DataRate,
    "data rate",
    [
        Sps2_5, Sps5, Sps10, Sps16_6, Sps20, Sps50, Sps60, Sps100, Sps400, Sps1200, Sps2400,
        Sps4800, Sps7200, Sps14400, Sps19200, Sps25600, Sps40000
    ]
);

impl DataRate {
    /// Nominal samples per second.
    pub fn sps(self) -> f32 {
        match self {
            DataRate::Sps2_5 => 2.5,
            DataRate::Sps5 => 5.0,
            DataRate::Sps10 => 10.0,
            DataRate::Sps16_6 => 16.6,
            DataRate::Sps20 => 20.0,
            DataRate::Sps50 => 50.0,
            DataRate::Sps60 => 60.0,
            DataRate::Sps100 => 100.0,
            DataRate::Sps400 => 400.0,
            DataRate::Sps1200 => 1200.0,
            DataRate::Sps2400 => 2400.0,
            DataRate::Sps4800 => 4800.0,
            DataRate::Sps7200 => 7200.0,
            DataRate::Sps14400 => 14400.0,
            DataRate::Sps19200 => 19200.0,
            DataRate::Sps25600 => 25600.0,
            DataRate::Sps40000 => 40000.0,
        }
    }

    /// Parse a whole-number rate such as `1200`. Fractional rates (2.5, 16.6)
    /// are only reachable through the enum.
    pub fn from_sps(value: u32) -> Result<Self> {
        DataRate::ALL
            .iter()
            .copied()
            .find(|r| r.sps().fract() == 0.0 && r.sps() as u32 == value)
            .ok_or_else(|| DriverError::invalid(format!("unsupported data rate {value} SPS")))
    }
}

/// Digital filter (MODE0.FILTER).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Filter {
    Sinc1 = 0,
    Sinc2 = 1,
    Sinc3 = 2,
    Sinc4 = 3,
    #[default]
    Fir = 4,
}
code_enum!(Filter, "filter", [Sinc1, Sinc2, Sinc3, Sinc4, Fir]);

/// Input chopping / AC excitation (MODE1.CHOP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Chop {
    #[default]
    Normal = 0,
    Chop = 1,
    TwoWireAc = 2,
    FourWireAc = 3,
}
code_enum!(Chop, "chop mode", [Normal, Chop, TwoWireAc, FourWireAc]);

/// Conversion start behavior (MODE1.CONVRT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConversionMode {
    /// Converts back-to-back after one START.
    #[default]
    Continuous = 0,
    /// One conversion per START.
    Pulse = 1,
}
code_enum!(ConversionMode, "conversion mode", [Continuous, Pulse]);

/// Reference pair selection (REF register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReferenceSource {
    /// Internal 2.5 V reference, buffer enabled.
    Internal = 0,
    /// Analog supply (AVDD/AVSS). Ratiometric for bridge sensors.
    #[default]
    AnalogSupply = 1,
    /// External reference on AIN0/AIN1.
    ExternalAin0Ain1 = 2,
    /// External reference on AIN2/AIN3.
    ExternalAin2Ain3 = 3,
}
code_enum!(
    ReferenceSource,
    "reference source",
    [Internal, AnalogSupply, ExternalAin0Ain1, ExternalAin2Ain3]
);

/// Multiplexer input selection (INPMUX nibbles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Input {
    AinCom = 0x0,
    Ain0 = 0x1,
    Ain1 = 0x2,
    Ain2 = 0x3,
    Ain3 = 0x4,
    Ain4 = 0x5,
    Ain5 = 0x6,
    Ain6 = 0x7,
    Ain7 = 0x8,
    Ain8 = 0x9,
    Ain9 = 0xA,
    Temperature = 0xB,
    AvddQuarter = 0xC,
    DvddQuarter = 0xD,
    Open = 0xE,
    Vcom = 0xF,
}
code_enum!(
    Input,
    "multiplexer input",
    [
        AinCom, Ain0, Ain1, Ain2, Ain3, Ain4, Ain5, Ain6, Ain7, Ain8, Ain9, Temperature,
        AvddQuarter, DvddQuarter, Open, Vcom
    ]
);

impl Input {
    /// Whether the input is a physical analog pin (AINx or AINCOM).
    pub fn is_analog_pin(self) -> bool {
        self.code() <= Input::Ain9.code()
    }
}

// ============================================================================
// Register Codecs
// ============================================================================

/// Decoded ID register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub dev_id: u8,
    pub rev_id: u8,
}

impl DeviceId {
    pub fn decode(reg: u8) -> Self {
        Self {
            dev_id: reg >> ID_DEV_SHIFT,
            rev_id: reg & ID_REV_MASK,
        }
    }
}

/// Decoded STATUS register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8);

impl Status {
    pub fn data_ready(self) -> bool {
        self.0 & status::DRDY != 0
    }

    pub fn reset_occurred(self) -> bool {
        self.0 & status::RESET != 0
    }

    pub fn external_clock(self) -> bool {
        self.0 & status::CLOCK != 0
    }

    pub fn reference_low_alarm(self) -> bool {
        self.0 & status::REFL_ALM != 0
    }

    /// Either PGA output rail alarm.
    pub fn pga_alarm(self) -> bool {
        self.0 & (status::PGAH_ALM | status::PGAL_ALM) != 0
    }

    pub fn crc_error(self) -> bool {
        self.0 & status::CRCERR != 0
    }

    pub fn locked(self) -> bool {
        self.0 & status::LOCK != 0
    }
}

/// MODE0: data rate and digital filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode0 {
    pub rate: DataRate,
    pub filter: Filter,
}

impl Mode0 {
    pub fn encode(self) -> u8 {
        ((self.rate.code() << MODE0_DR_SHIFT) & MODE0_DR_MASK)
            | (self.filter.code() & MODE0_FILTER_MASK)
    }

    pub fn decode(reg: u8) -> Result<Self> {
        Ok(Self {
            rate: DataRate::try_from((reg & MODE0_DR_MASK) >> MODE0_DR_SHIFT)?,
            filter: Filter::try_from(reg & MODE0_FILTER_MASK)?,
        })
    }
}

/// MODE1: chop, conversion mode and conversion start delay code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode1 {
    pub chop: Chop,
    pub mode: ConversionMode,
    pub delay: u8,
}

impl Mode1 {
    /// Highest documented DELAY code (17.8 ms).
    pub const MAX_DELAY: u8 = 0x0D;

    pub fn encode(self) -> Result<u8> {
        if self.delay > Self::MAX_DELAY {
            return Err(DriverError::invalid(format!(
                "conversion delay code {:#04X} is not defined",
                self.delay
            )));
        }
        Ok(((self.chop.code() << MODE1_CHOP_SHIFT) & MODE1_CHOP_MASK)
            | ((self.mode.code() << MODE1_CONVRT_SHIFT) & MODE1_CONVRT_MASK)
            | (self.delay & MODE1_DELAY_MASK))
    }

    pub fn decode(reg: u8) -> Result<Self> {
        Ok(Self {
            chop: Chop::try_from((reg & MODE1_CHOP_MASK) >> MODE1_CHOP_SHIFT)?,
            mode: ConversionMode::try_from((reg & MODE1_CONVRT_MASK) >> MODE1_CONVRT_SHIFT)?,
            delay: reg & MODE1_DELAY_MASK,
        })
    }
}

impl Default for Mode1 {
    fn default() -> Self {
        Self {
            chop: Chop::Normal,
            mode: ConversionMode::Continuous,
            delay: 0x01,
        }
    }
}

impl ReferenceSource {
    /// REF register value; reserved bits 7:5 stay at their reset value of 0.
    pub fn encode(self) -> u8 {
        let (refenb, mux) = match self {
            ReferenceSource::Internal => (REF_REFENB, 0b00),
            ReferenceSource::AnalogSupply => (0, 0b01),
            ReferenceSource::ExternalAin0Ain1 => (0, 0b10),
            ReferenceSource::ExternalAin2Ain3 => (0, 0b11),
        };
        refenb | ((mux << REF_RMUXP_SHIFT) & REF_RMUXP_MASK) | (mux & REF_RMUXN_MASK)
    }

    /// Decode a REF value. Mixed positive/negative selections have no
    /// counterpart here and are rejected.
    pub fn decode(reg: u8) -> Result<Self> {
        let p = (reg & REF_RMUXP_MASK) >> REF_RMUXP_SHIFT;
        let n = reg & REF_RMUXN_MASK;
        if p != n {
            return Err(DriverError::Protocol(format!(
                "reference mux pair {p:#04b}/{n:#04b} is not a matched source"
            )));
        }
        ReferenceSource::try_from(p)
    }
}

/// PGA register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pga {
    pub gain: Gain,
    pub bypass: bool,
}

impl Pga {
    pub fn encode(self) -> u8 {
        let bypass = if self.bypass { PGA_BYPASS } else { 0 };
        bypass | (self.gain.code() & PGA_GAIN_MASK)
    }

    pub fn decode(reg: u8) -> Result<Self> {
        Ok(Self {
            gain: Gain::try_from(reg & PGA_GAIN_MASK)?,
            bypass: reg & PGA_BYPASS != 0,
        })
    }
}

/// INPMUX register: positive and negative input selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputMux {
    pub positive: Input,
    pub negative: Input,
}

impl InputMux {
    pub fn encode(self) -> u8 {
        (self.positive.code() << INPMUX_MUXP_SHIFT) | (self.negative.code() & INPMUX_MUXN_MASK)
    }

    pub fn decode(reg: u8) -> Self {
        let lookup = |code: u8| Input::ALL[(code & 0x0F) as usize];
        Self {
            positive: lookup(reg >> INPMUX_MUXP_SHIFT),
            negative: lookup(reg & INPMUX_MUXN_MASK),
        }
    }
}

/// Sign-extend a 24-bit two's-complement value to `i32`.
#[inline]
pub fn sign_extend_24(raw: u32) -> i32 {
    let value = (raw & 0x00FF_FFFF) as i32;
    if value & 0x0080_0000 != 0 {
        value - 0x0100_0000
    } else {
        value
    }
}

// ============================================================================
// Converter Settings
// ============================================================================

/// Static converter configuration applied by [`Ads1261::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterSettings {
    pub gain: Gain,
    pub data_rate: DataRate,
    pub filter: Filter,
    pub reference: ReferenceSource,
    pub conversion_mode: ConversionMode,
    pub chop: Chop,
    pub reset_settle: Duration,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            gain: Gain::X128,
            data_rate: DataRate::Sps40000,
            filter: Filter::Fir,
            reference: ReferenceSource::AnalogSupply,
            conversion_mode: ConversionMode::Continuous,
            chop: Chop::Normal,
            reset_settle: RESET_SETTLE,
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Last values written to the configuration registers. Used to compose
/// single-field updates without a read-back.
#[derive(Debug, Clone, Copy)]
struct Shadow {
    mode0: Mode0,
    mode1: Mode1,
    pga: Pga,
}

impl Default for Shadow {
    fn default() -> Self {
        Self {
            mode0: Mode0 {
                rate: DataRate::Sps20,
                filter: Filter::Fir,
            },
            mode1: Mode1::default(),
            pga: Pga::default(),
        }
    }
}

/// ADS1261 driver.
///
/// # Example
/// ```ignore
/// let mut adc = Ads1261::new(transport);
/// adc.configure(&ConverterSettings::default())?;
/// adc.set_multiplexer(Input::Ain0, Input::Ain1)?;
/// let raw = adc.read_conversion_data()?;
/// ```
pub struct Ads1261<T> {
    transport: T,
    shadow: Shadow,
}

impl<T: Transport> Ads1261<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            shadow: Shadow::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Issue `RESET`. The caller must wait [`RESET_SETTLE`] before the next command.
    pub fn reset(&mut self) -> Result<()> {
        self.send_command(cmd::RESET)?;
        self.shadow = Shadow::default();
        debug!("converter reset issued");
        Ok(())
    }

    pub fn start_conversion(&mut self) -> Result<()> {
        self.send_command(cmd::START)
    }

    pub fn stop_conversion(&mut self) -> Result<()> {
        self.send_command(cmd::STOP)
    }

    /// Read one register: opcode, dummy byte, data byte.
    pub fn read_register(&mut self, reg: Register) -> Result<u8> {
        let mut sel = Selected::begin(&mut self.transport)?;
        sel.transact(&[cmd::RREG | reg.addr()], 0)?;
        sel.transact(&[DUMMY], 0)?;
        let rx = sel.transact(&[], 1)?;
        sel.finish()?;

        let value = first_byte(&rx)?;
        trace!("RREG {} -> {:#04X}", reg, value);
        Ok(value)
    }

    /// Read a register by raw address.
    pub fn read_register_at(&mut self, addr: u8) -> Result<u8> {
        self.read_register(Register::try_from(addr)?)
    }

    /// Write one register: opcode, then value.
    pub fn write_register(&mut self, reg: Register, value: u8) -> Result<()> {
        if !reg.is_writable() {
            return Err(DriverError::invalid(format!("register {reg} is not writable")));
        }
        let mut sel = Selected::begin(&mut self.transport)?;
        sel.transact(&[cmd::WREG | reg.addr()], 0)?;
        sel.transact(&[value], 0)?;
        sel.finish()?;

        trace!("WREG {} <- {:#04X}", reg, value);
        Ok(())
    }

    /// Write a register by raw address.
    pub fn write_register_at(&mut self, addr: u8, value: u8) -> Result<()> {
        self.write_register(Register::try_from(addr)?, value)
    }

    /// Issue `RDATA` and decode the 24-bit big-endian result.
    pub fn read_conversion_data(&mut self) -> Result<i32> {
        let mut sel = Selected::begin(&mut self.transport)?;
        sel.transact(&[cmd::RDATA], 0)?;
        let rx = sel.transact(&[], 3)?;
        sel.finish()?;

        if rx.len() != 3 {
            return Err(DriverError::Transport(format!(
                "expected 3 data bytes, got {}",
                rx.len()
            )));
        }
        let raw = ((rx[0] as u32) << 16) | ((rx[1] as u32) << 8) | (rx[2] as u32);
        let value = sign_extend_24(raw);
        trace!("RDATA {:02X?} -> {}", rx, value);
        Ok(value)
    }

    // ------------------------------------------------------------------------
    // Configuration Helpers
    // ------------------------------------------------------------------------

    pub fn set_multiplexer(&mut self, positive: Input, negative: Input) -> Result<()> {
        let mux = InputMux { positive, negative };
        self.write_register(Register::Inpmux, mux.encode())
    }

    /// Same as [`Self::set_multiplexer`] for raw nibble codes.
    pub fn set_multiplexer_codes(&mut self, positive: u8, negative: u8) -> Result<()> {
        self.set_multiplexer(Input::try_from(positive)?, Input::try_from(negative)?)
    }

    pub fn set_gain(&mut self, gain: Gain) -> Result<()> {
        let pga = Pga { gain, ..self.shadow.pga };
        self.write_register(Register::Pga, pga.encode())?;
        self.shadow.pga = pga;
        Ok(())
    }

    pub fn set_gain_code(&mut self, code: u8) -> Result<()> {
        self.set_gain(Gain::try_from(code)?)
    }

    pub fn set_data_rate(&mut self, rate: DataRate) -> Result<()> {
        let mode0 = Mode0 { rate, ..self.shadow.mode0 };
        self.write_register(Register::Mode0, mode0.encode())?;
        self.shadow.mode0 = mode0;
        Ok(())
    }

    pub fn set_data_rate_code(&mut self, code: u8) -> Result<()> {
        self.set_data_rate(DataRate::try_from(code)?)
    }

    pub fn set_filter(&mut self, filter: Filter) -> Result<()> {
        let mode0 = Mode0 { filter, ..self.shadow.mode0 };
        self.write_register(Register::Mode0, mode0.encode())?;
        self.shadow.mode0 = mode0;
        Ok(())
    }

    pub fn set_reference_source(&mut self, source: ReferenceSource) -> Result<()> {
        self.write_register(Register::Ref, source.encode())
    }

    pub fn set_reference_code(&mut self, code: u8) -> Result<()> {
        self.set_reference_source(ReferenceSource::try_from(code)?)
    }

    pub fn set_conversion_mode(&mut self, mode: ConversionMode) -> Result<()> {
        self.write_mode1(Mode1 { mode, ..self.shadow.mode1 })
    }

    pub fn set_chop(&mut self, chop: Chop) -> Result<()> {
        self.write_mode1(Mode1 { chop, ..self.shadow.mode1 })
    }

    /// Conversion mode most recently written.
    pub fn conversion_mode(&self) -> ConversionMode {
        self.shadow.mode1.mode
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub fn read_status(&mut self) -> Result<Status> {
        self.read_register(Register::Status).map(Status)
    }

    pub fn read_device_id(&mut self) -> Result<DeviceId> {
        self.read_register(Register::Id).map(DeviceId::decode)
    }

    /// Clear the STATUS.RESET flag so a later brown-out reset is detectable.
    pub fn clear_reset_flag(&mut self) -> Result<()> {
        self.write_register(Register::Status, 0x00)
    }

    /// Read every register in address order.
    pub fn read_all_registers(&mut self) -> Result<Vec<(Register, u8)>> {
        Register::ALL
            .iter()
            .map(|&reg| self.read_register(reg).map(|v| (reg, v)))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Init Sequence
    // ------------------------------------------------------------------------

    /// Reset the device and apply `settings`.
    ///
    /// A device id other than [`EXPECTED_DEV_ID`] is logged but not fatal;
    /// some boards report a different family nibble on early silicon.
    pub fn configure(&mut self, settings: &ConverterSettings) -> Result<DeviceId> {
        self.reset()?;
        if !settings.reset_settle.is_zero() {
            thread::sleep(settings.reset_settle);
        }
        self.clear_reset_flag()?;

        let id = self.read_device_id()?;
        if id.dev_id != EXPECTED_DEV_ID {
            warn!(
                "unexpected device id {:#X} (rev {:#X}), expected {:#X}; continuing anyway",
                id.dev_id, id.rev_id, EXPECTED_DEV_ID
            );
        }

        let mode0 = Mode0 {
            rate: settings.data_rate,
            filter: settings.filter,
        };
        self.write_register(Register::Mode0, mode0.encode())?;
        self.shadow.mode0 = mode0;

        self.write_mode1(Mode1 {
            chop: settings.chop,
            mode: settings.conversion_mode,
            ..Mode1::default()
        })?;
        self.set_gain(settings.gain)?;
        self.set_reference_source(settings.reference)?;

        if settings.conversion_mode == ConversionMode::Continuous {
            self.start_conversion()?;
        }

        debug!(
            "configured: id={:#X}/{:#X} gain={}x rate={} SPS filter={:?} ref={:?} mode={:?}",
            id.dev_id,
            id.rev_id,
            settings.gain.multiplier(),
            settings.data_rate.sps(),
            settings.filter,
            settings.reference,
            settings.conversion_mode
        );
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn send_command(&mut self, opcode: u8) -> Result<()> {
        let mut sel = Selected::begin(&mut self.transport)?;
        sel.transact(&[opcode], 0)?;
        sel.finish()?;
        trace!("command {:#04X}", opcode);
        Ok(())
    }

    fn write_mode1(&mut self, mode1: Mode1) -> Result<()> {
        self.write_register(Register::Mode1, mode1.encode()?)?;
        self.shadow.mode1 = mode1;
        Ok(())
    }
}

fn first_byte(rx: &[u8]) -> Result<u8> {
    rx.first()
        .copied()
        .ok_or_else(|| DriverError::Transport("register read returned no data".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Select,
        Deselect,
        Tx(Vec<u8>, usize),
    }

    #[derive(Default)]
    struct Script {
        events: Vec<Event>,
        replies: VecDeque<Vec<u8>>,
        fail_after: Option<usize>,
    }

    impl Transport for Script {
        fn select(&mut self) -> Result<()> {
            self.events.push(Event::Select);
            Ok(())
        }

        fn deselect(&mut self) -> Result<()> {
            self.events.push(Event::Deselect);
            Ok(())
        }

        fn transact(&mut self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>> {
            let done = self
                .events
                .iter()
                .filter(|e| matches!(e, Event::Tx(..)))
                .count();
            if self.fail_after == Some(done) {
                return Err(DriverError::Transport("injected".into()));
            }
            self.events.push(Event::Tx(tx.to_vec(), rx_len));
            if rx_len == 0 {
                return Ok(Vec::new());
            }
            Ok(self.replies.pop_front().unwrap_or_else(|| vec![0; rx_len]))
        }
    }

    #[test]
    fn sign_extension_boundaries() {
        assert_eq!(sign_extend_24(0x80_0000), -8_388_608);
        assert_eq!(sign_extend_24(0x7F_FFFF), 8_388_607);
        assert_eq!(sign_extend_24(0x00_0001), 1);
        assert_eq!(sign_extend_24(0xFF_FFFF), -1);
        assert_eq!(sign_extend_24(0x00_0000), 0);
    }

    #[test]
    fn sign_extension_matches_subtraction_rule() {
        for raw in (0u32..0x100_0000).step_by(0x1_0001) {
            let expected = if raw & 0x80_0000 != 0 {
                raw as i64 - 0x100_0000
            } else {
                raw as i64
            };
            assert_eq!(sign_extend_24(raw) as i64, expected, "raw={raw:#08X}");
        }
    }

    #[test]
    fn read_conversion_data_is_big_endian() {
        let mut adc = Ads1261::new(Script {
            replies: VecDeque::from(vec![vec![0xFF, 0xFF, 0xFE]]),
            ..Default::default()
        });
        assert_eq!(adc.read_conversion_data().unwrap(), -2);
        assert_eq!(
            adc.transport().events,
            vec![
                Event::Select,
                Event::Tx(vec![0x12], 0),
                Event::Tx(vec![], 3),
                Event::Deselect
            ]
        );
    }

    #[test]
    fn read_register_inserts_dummy_byte() {
        let mut adc = Ads1261::new(Script {
            replies: VecDeque::from(vec![vec![0x24]]),
            ..Default::default()
        });
        assert_eq!(adc.read_register(Register::Mode0).unwrap(), 0x24);
        assert_eq!(
            adc.transport().events,
            vec![
                Event::Select,
                Event::Tx(vec![0x22], 0),
                Event::Tx(vec![0x00], 0),
                Event::Tx(vec![], 1),
                Event::Deselect
            ]
        );
    }

    #[test]
    fn write_register_is_two_exchanges() {
        let mut adc = Ads1261::new(Script::default());
        adc.write_register(Register::Inpmux, 0x12).unwrap();
        assert_eq!(
            adc.transport().events,
            vec![
                Event::Select,
                Event::Tx(vec![0x51], 0),
                Event::Tx(vec![0x12], 0),
                Event::Deselect
            ]
        );
    }

    #[test]
    fn failure_mid_sequence_still_deselects() {
        let mut adc = Ads1261::new(Script {
            fail_after: Some(1),
            ..Default::default()
        });
        let err = adc.read_conversion_data().unwrap_err();
        assert!(matches!(err, DriverError::Transport(_)));
        assert_eq!(
            adc.transport().events,
            vec![Event::Select, Event::Tx(vec![0x12], 0), Event::Deselect]
        );
    }

    #[test]
    fn invalid_codes_are_rejected() {
        let mut adc = Ads1261::new(Script::default());
        assert!(matches!(
            adc.set_gain_code(8),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            adc.set_multiplexer_codes(0x10, 0x01),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            adc.read_register_at(0x13),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            adc.write_register(Register::Id, 0),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(adc.transport().events.is_empty());
    }

    #[test]
    fn multiplexer_nibbles() {
        let mux = InputMux {
            positive: Input::Ain2,
            negative: Input::Ain3,
        };
        assert_eq!(mux.encode(), 0x34);
        assert_eq!(InputMux::decode(0x34), mux);
    }

    #[test]
    fn field_encoders_preserve_reserved_bits() {
        let pga = Pga {
            gain: Gain::X128,
            bypass: false,
        };
        assert_eq!(pga.encode(), 0x07);
        assert_eq!(Pga::decode(0x87).unwrap().bypass, true);

        assert_eq!(ReferenceSource::AnalogSupply.encode(), Register::Ref.reset_value());
        assert_eq!(ReferenceSource::Internal.encode(), 0x10);
        assert_eq!(ReferenceSource::decode(0x0F).unwrap(), ReferenceSource::ExternalAin2Ain3);
        assert!(ReferenceSource::decode(0x06).is_err());

        let reset_mode0 = Mode0 {
            rate: DataRate::Sps20,
            filter: Filter::Fir,
        };
        assert_eq!(reset_mode0.encode(), Register::Mode0.reset_value());
        assert_eq!(Mode0::decode(0x84).unwrap().rate, DataRate::Sps40000);

        assert_eq!(Mode1::default().encode().unwrap(), Register::Mode1.reset_value());
        let pulse = Mode1 {
            mode: ConversionMode::Pulse,
            ..Mode1::default()
        };
        assert_eq!(pulse.encode().unwrap(), 0x11);
        assert!(Mode1 {
            delay: 0x0E,
            ..Mode1::default()
        }
        .encode()
        .is_err());
    }

    #[test]
    fn gain_helper_keeps_other_fields() {
        let mut adc = Ads1261::new(Script::default());
        adc.set_data_rate(DataRate::Sps1200).unwrap();
        adc.set_filter(Filter::Sinc3).unwrap();
        let bytes: Vec<u8> = adc
            .transport()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Tx(tx, 0) => tx.first().copied(),
                _ => None,
            })
            .collect();
        assert_eq!(bytes, vec![0x42, (0x09 << 3) | 0x04, 0x42, (0x09 << 3) | 0x02]);
    }

    #[test]
    fn status_bits() {
        let st = Status(status::DRDY | status::RESET);
        assert!(st.data_ready());
        assert!(st.reset_occurred());
        assert!(!st.pga_alarm());
        assert!(Status(status::PGAL_ALM).pga_alarm());
    }

    #[test]
    fn register_table_is_address_ordered() {
        for (i, reg) in Register::ALL.iter().enumerate() {
            assert_eq!(reg.addr() as usize, i);
            assert_eq!(Register::try_from(i as u8).unwrap(), *reg);
        }
    }

    #[test]
    fn gain_and_rate_parsing() {
        assert_eq!(Gain::from_multiplier(128).unwrap(), Gain::X128);
        assert!(Gain::from_multiplier(3).is_err());
        assert_eq!(DataRate::from_sps(40000).unwrap(), DataRate::Sps40000);
        assert_eq!(DataRate::from_sps(1200).unwrap(), DataRate::Sps1200);
        assert!(DataRate::from_sps(17).is_err());
    }
}
