//! Byte-level bus abstraction used by the converter driver.
//!
//! The driver never touches pins or clocks. It needs two things from the bus
//! layer: a logical select boundary and byte exchanges inside it. Anything
//! that provides those (a Linux spidev handle, an MCU HAL, the software model
//! in [`crate::sim`]) can carry the protocol.

use std::convert::Infallible;

use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::SpiBus;
use log::warn;

use crate::errors::{DriverError, Result};

// ============================================================================
// Transport Trait
// ============================================================================

/// Synchronous serial transport with an explicit select boundary.
pub trait Transport {
    /// Assert the logical chip-select.
    fn select(&mut self) -> Result<()>;

    /// Release the logical chip-select.
    fn deselect(&mut self) -> Result<()>;

    /// Clock out `tx`, then clock in `rx_len` bytes (transmitting zeros) and
    /// return them. Either part may be empty.
    fn transact(&mut self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn select(&mut self) -> Result<()> {
        (**self).select()
    }

    fn deselect(&mut self) -> Result<()> {
        (**self).deselect()
    }

    fn transact(&mut self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>> {
        (**self).transact(tx, rx_len)
    }
}

// ============================================================================
// Select Guard
// ============================================================================

/// An asserted select boundary.
///
/// The select line is released by [`Selected::finish`] on the happy path and
/// by `Drop` on every other exit, so a `?` in the middle of a multi-byte
/// sequence cannot leave the device selected.
pub struct Selected<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    released: bool,
}

impl<'a, T: Transport + ?Sized> Selected<'a, T> {
    pub fn begin(transport: &'a mut T) -> Result<Self> {
        transport.select()?;
        Ok(Self {
            transport,
            released: false,
        })
    }

    /// One byte-level exchange inside the select boundary.
    pub fn transact(&mut self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>> {
        self.transport.transact(tx, rx_len)
    }

    /// Release the select line and report whether that succeeded.
    pub fn finish(mut self) -> Result<()> {
        self.released = true;
        self.transport.deselect()
    }
}

impl<T: Transport + ?Sized> Drop for Selected<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.transport.deselect() {
                warn!("failed to release select after aborted exchange: {}", e);
            }
        }
    }
}

// ============================================================================
// embedded-hal Adapter
// ============================================================================

/// Chip-select that is tied low in hardware (always selected).
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwiredSelect;

impl digital::ErrorType for HardwiredSelect {
    type Error = Infallible;
}

impl OutputPin for HardwiredSelect {
    fn set_low(&mut self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

/// [`Transport`] over an embedded-hal 1.0 SPI bus and a software-toggled
/// chip-select pin (active low).
pub struct HalTransport<SPI, CS> {
    spi: SPI,
    cs: CS,
}

impl<SPI, CS> HalTransport<SPI, CS>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self { spi, cs }
    }

    /// Give back the bus and the pin.
    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

impl<SPI> HalTransport<SPI, HardwiredSelect>
where
    SPI: SpiBus<u8>,
{
    /// Transport for boards where the converter's CS is strapped to ground.
    pub fn hardwired(spi: SPI) -> Self {
        Self::new(spi, HardwiredSelect)
    }
}

impl<SPI, CS> Transport for HalTransport<SPI, CS>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
{
    fn select(&mut self) -> Result<()> {
        self.cs
            .set_low()
            .map_err(|e| DriverError::Transport(format!("chip-select assert: {e:?}")))
    }

    fn deselect(&mut self) -> Result<()> {
        // CS goes high even when the flush fails; the flush error wins.
        let flushed = self
            .spi
            .flush()
            .map_err(|e| DriverError::Transport(format!("spi flush: {e:?}")));
        let released = self
            .cs
            .set_high()
            .map_err(|e| DriverError::Transport(format!("chip-select release: {e:?}")));
        flushed.and(released)
    }

    fn transact(&mut self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>> {
        if !tx.is_empty() {
            self.spi
                .write(tx)
                .map_err(|e| DriverError::Transport(format!("spi write: {e:?}")))?;
        }
        let mut rx = vec![0u8; rx_len];
        if rx_len > 0 {
            self.spi
                .read(&mut rx)
                .map_err(|e| DriverError::Transport(format!("spi read: {e:?}")))?;
        }
        Ok(rx)
    }
}
