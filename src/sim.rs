//! Software model of the converter.
//!
//! [`SimulatedAdc`] decodes the same byte-level exchanges the real part sees
//! and answers from an in-memory register file. Conversion results are set
//! per input pair by the owner of a cloned handle, which is how the demo
//! binary and the tests drive a "load" onto the plate without hardware.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::digital::{ErrorType, InputPin};
use log::trace;

use crate::acquisition::ChannelDescriptor;
use crate::ads1261::{status, InputMux, Register};
use crate::errors::{DriverError, Result};
use crate::ready::{DrdyInterrupt, DrdyNotifier};
use crate::transport::Transport;

/// ID register value reported by the model (device 0x8, revision 0x2).
pub const SIM_DEVICE_ID: u8 = 0x82;

const MODE1_CONVRT: u8 = 1 << 4;
const REGISTER_COUNT: usize = Register::ALL.len();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    RregDummy(Register),
    RregData(Register),
    WregValue(Register),
    Rdata,
}

#[derive(Debug)]
struct SimState {
    registers: [u8; REGISTER_COUNT],
    selected: bool,
    phase: Phase,
    converting: bool,
    data_ready: bool,
    polls_left: u32,
    ready_latency: u32,
    codes: HashMap<u8, i32>,
    stalled: HashSet<u8>,
    mux_log: Vec<u8>,
    starts: usize,
    exchanges: usize,
    fail_next: bool,
}

impl SimState {
    fn new() -> Self {
        let mut state = Self {
            registers: [0; REGISTER_COUNT],
            selected: false,
            phase: Phase::Idle,
            converting: false,
            data_ready: false,
            polls_left: 0,
            ready_latency: 1,
            codes: HashMap::new(),
            stalled: HashSet::new(),
            mux_log: Vec::new(),
            starts: 0,
            exchanges: 0,
            fail_next: false,
        };
        state.power_on();
        state
    }

    fn power_on(&mut self) {
        for reg in Register::ALL {
            self.registers[reg.addr() as usize] = reg.reset_value();
        }
        self.registers[Register::Id.addr() as usize] = SIM_DEVICE_ID;
        self.converting = false;
        self.data_ready = false;
    }

    fn reg(&self, reg: Register) -> u8 {
        self.registers[reg.addr() as usize]
    }

    fn pulse_mode(&self) -> bool {
        self.reg(Register::Mode1) & MODE1_CONVRT != 0
    }

    fn restart_conversion(&mut self) {
        self.data_ready = false;
        self.polls_left = self.ready_latency;
    }

    /// One observation of DRDY. Conversions complete after `ready_latency`
    /// observations, or never on a stalled pair.
    fn observe_ready(&mut self) -> bool {
        let mux = self.reg(Register::Inpmux);
        if self.converting && !self.data_ready && !self.stalled.contains(&mux) {
            if self.polls_left == 0 {
                self.data_ready = true;
            } else {
                self.polls_left -= 1;
            }
        }
        self.data_ready
    }

    fn read(&mut self, reg: Register) -> u8 {
        match reg {
            Register::Status => {
                let drdy = if self.observe_ready() { status::DRDY } else { 0 };
                (self.reg(Register::Status) & !status::DRDY) | drdy
            }
            _ => self.reg(reg),
        }
    }

    fn write(&mut self, reg: Register, value: u8) {
        match reg {
            Register::Status => {
                // Only the RESET flag is writable; writing 0 clears it.
                let kept = self.reg(Register::Status) & !status::RESET;
                self.registers[reg.addr() as usize] = kept | (value & status::RESET);
            }
            _ => self.registers[reg.addr() as usize] = value,
        }
        if reg == Register::Inpmux {
            self.mux_log.push(value);
            if self.converting {
                self.restart_conversion();
            }
        }
    }

    fn conversion_bytes(&mut self) -> Vec<u8> {
        let mux = self.reg(Register::Inpmux);
        let code = self
            .codes
            .get(&mux)
            .copied()
            .unwrap_or(0)
            .clamp(-0x80_0000, 0x7F_FFFF);
        self.data_ready = false;
        if self.pulse_mode() {
            self.converting = false;
        } else {
            self.polls_left = self.ready_latency;
        }
        let raw = (code as u32) & 0x00FF_FFFF;
        vec![(raw >> 16) as u8, (raw >> 8) as u8, raw as u8]
    }

    fn command(&mut self, opcode: u8) -> Result<()> {
        match opcode {
            0x06 => self.power_on(),
            0x08 => {
                self.starts += 1;
                self.converting = true;
                self.restart_conversion();
            }
            0x0A => self.converting = false,
            0x12 => self.phase = Phase::Rdata,
            0x20..=0x3F => self.phase = Phase::RregDummy(Register::try_from(opcode & 0x1F)?),
            0x40..=0x5F => self.phase = Phase::WregValue(Register::try_from(opcode & 0x1F)?),
            _ => {
                return Err(DriverError::Protocol(format!(
                    "opcode {opcode:#04X} not modelled"
                )))
            }
        }
        trace!("sim: opcode {:#04X}", opcode);
        Ok(())
    }

    fn exchange(&mut self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>> {
        if !self.selected {
            return Err(DriverError::Transport("exchange outside select".into()));
        }
        self.exchanges += 1;
        if self.fail_next {
            self.fail_next = false;
            return Err(DriverError::Transport("simulated bus fault".into()));
        }

        match (self.phase, tx, rx_len) {
            (Phase::Idle, [opcode], 0) => {
                self.command(*opcode)?;
                Ok(Vec::new())
            }
            (Phase::RregDummy(reg), [_], 0) => {
                self.phase = Phase::RregData(reg);
                Ok(Vec::new())
            }
            (Phase::RregData(reg), [], 1) => {
                self.phase = Phase::Idle;
                Ok(vec![self.read(reg)])
            }
            (Phase::WregValue(reg), [value], 0) => {
                self.phase = Phase::Idle;
                self.write(reg, *value);
                Ok(Vec::new())
            }
            (Phase::Rdata, [], 3) => {
                self.phase = Phase::Idle;
                Ok(self.conversion_bytes())
            }
            (phase, tx, rx_len) => Err(DriverError::Protocol(format!(
                "unexpected exchange {tx:02X?}/{rx_len} in {phase:?}"
            ))),
        }
    }
}

/// Cloneable handle to one simulated converter.
#[derive(Debug, Clone)]
pub struct SimulatedAdc {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdc {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Conversion result returned while `channel` is selected.
    pub fn set_raw(&self, channel: ChannelDescriptor, raw: i32) {
        self.lock().codes.insert(mux_code(channel), raw);
    }

    /// A stalled pair never reports DRDY.
    pub fn stall(&self, channel: ChannelDescriptor, stalled: bool) {
        let code = mux_code(channel);
        let mut state = self.lock();
        if stalled {
            state.stalled.insert(code);
        } else {
            state.stalled.remove(&code);
        }
    }

    /// DRDY observations needed before a conversion completes.
    pub fn set_ready_latency(&self, polls: u32) {
        self.lock().ready_latency = polls;
    }

    /// Fail the next byte exchange with a transport error.
    pub fn fail_next_exchange(&self) {
        self.lock().fail_next = true;
    }

    pub fn register(&self, reg: Register) -> u8 {
        self.lock().reg(reg)
    }

    /// INPMUX values written so far, in order.
    pub fn mux_log(&self) -> Vec<u8> {
        self.lock().mux_log.clone()
    }

    pub fn clear_mux_log(&self) {
        self.lock().mux_log.clear();
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges
    }

    pub fn is_selected(&self) -> bool {
        self.lock().selected
    }

    pub fn is_converting(&self) -> bool {
        self.lock().converting
    }

    /// The model's DRDY output as an active-low input pin.
    pub fn drdy_pin(&self) -> SimDrdyPin {
        SimDrdyPin {
            state: Arc::clone(&self.state),
        }
    }
}

impl Transport for SimulatedAdc {
    fn select(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.selected {
            return Err(DriverError::Transport("select while already selected".into()));
        }
        state.selected = true;
        Ok(())
    }

    fn deselect(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.selected = false;
        state.phase = Phase::Idle;
        Ok(())
    }

    fn transact(&mut self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>> {
        self.lock().exchange(tx, rx_len)
    }
}

/// DRDY line of a [`SimulatedAdc`].
#[derive(Debug, Clone)]
pub struct SimDrdyPin {
    state: Arc<Mutex<SimState>>,
}

impl ErrorType for SimDrdyPin {
    type Error = Infallible;
}

impl InputPin for SimDrdyPin {
    fn is_high(&mut self) -> std::result::Result<bool, Infallible> {
        self.is_low().map(|low| !low)
    }

    fn is_low(&mut self) -> std::result::Result<bool, Infallible> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.observe_ready())
    }
}

/// The model has no edge detection; callers fall back to polling.
impl DrdyInterrupt for SimDrdyPin {
    fn install(&mut self, _notifier: DrdyNotifier) -> Result<()> {
        Err(DriverError::NotReady(
            "simulated converter has no interrupt line".into(),
        ))
    }
}

fn mux_code(channel: ChannelDescriptor) -> u8 {
    InputMux {
        positive: channel.positive,
        negative: channel.negative,
    }
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads1261::{Ads1261, ConverterSettings, Gain, Input};
    use std::time::Duration;

    fn configured(sim: &SimulatedAdc) -> Ads1261<SimulatedAdc> {
        let mut adc = Ads1261::new(sim.clone());
        adc.configure(&ConverterSettings {
            reset_settle: Duration::ZERO,
            ..Default::default()
        })
        .unwrap();
        adc
    }

    #[test]
    fn configure_leaves_expected_registers() {
        let sim = SimulatedAdc::new();
        let mut adc = configured(&sim);
        assert_eq!(sim.register(Register::Pga), Gain::X128.code());
        assert_eq!(sim.register(Register::Mode0), (0x10 << 3) | 0x04);
        assert_eq!(sim.register(Register::Ref), 0x05);
        assert_eq!(sim.register(Register::Status) & status::RESET, 0);
        assert!(sim.is_converting());
        assert_eq!(adc.read_device_id().unwrap().dev_id, 0x8);
        assert!(!sim.is_selected());
    }

    #[test]
    fn negative_codes_come_back_sign_extended() {
        let sim = SimulatedAdc::new();
        let ch = ChannelDescriptor::new(Input::Ain0, Input::Ain1);
        sim.set_raw(ch, -8_388_608);
        let mut adc = configured(&sim);
        adc.set_multiplexer(ch.positive, ch.negative).unwrap();
        assert_eq!(adc.read_conversion_data().unwrap(), -8_388_608);
    }

    #[test]
    fn drdy_follows_latency() {
        let sim = SimulatedAdc::new();
        sim.set_ready_latency(2);
        let mut adc = configured(&sim);
        adc.set_multiplexer(Input::Ain2, Input::Ain3).unwrap();
        assert!(!adc.read_status().unwrap().data_ready());
        assert!(!adc.read_status().unwrap().data_ready());
        assert!(adc.read_status().unwrap().data_ready());
        adc.read_conversion_data().unwrap();
        assert!(!adc.read_status().unwrap().data_ready());
    }

    #[test]
    fn read_all_registers_walks_the_map() {
        let sim = SimulatedAdc::new();
        let mut adc = configured(&sim);
        let dump = adc.read_all_registers().unwrap();
        assert_eq!(dump.len(), Register::ALL.len());
        assert_eq!(dump[0], (Register::Id, SIM_DEVICE_ID));
        assert_eq!(dump[Register::Fscal2.addr() as usize].1, 0x40);
    }

    #[test]
    fn exchange_without_select_is_rejected() {
        let mut sim = SimulatedAdc::new();
        assert!(sim.transact(&[0x08], 0).is_err());
    }
}
