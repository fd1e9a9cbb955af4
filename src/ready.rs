//! Conversion-ready detection.
//!
//! The converter pulls its DRDY line low when a result is available. Two
//! ways of observing that live here: a binary semaphore released by an edge
//! interrupt, and plain polling of the pin level. The third method, polling
//! STATUS.DRDY over the bus, needs the driver and lives in the acquisition
//! pipeline.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use embedded_hal::digital::InputPin;
use log::{debug, warn};

use crate::errors::{DriverError, Result};

/// Default pause between polls of a ready line or status register.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Source of "conversion complete" events.
pub trait ReadySignal: Send {
    /// Block until the converter reports a completed conversion or
    /// `timeout` elapses.
    fn await_ready(&mut self, timeout: Duration) -> Result<Readiness>;

    /// Forget readiness left over from a conversion that is no longer wanted,
    /// e.g. one started before the multiplexer changed.
    fn clear(&mut self) {}
}

impl<S: ReadySignal + ?Sized> ReadySignal for Box<S> {
    fn await_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        (**self).await_ready(timeout)
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}

// ============================================================================
// Interrupt-Driven Semaphore
// ============================================================================

type Slot = Arc<(Mutex<bool>, Condvar)>;

/// Single-slot signal set by an interrupt handler and consumed by the
/// acquisition task. Several signals before one wait collapse into one.
#[derive(Debug, Default)]
pub struct DrdySemaphore {
    slot: Slot,
}

/// Handle given to the interrupt handler. Its only job is [`DrdyNotifier::signal`].
#[derive(Debug, Clone)]
pub struct DrdyNotifier {
    slot: Slot,
}

impl DrdyNotifier {
    /// Release the waiting task. Never blocks on the waiter.
    pub fn signal(&self) {
        let (lock, cvar) = &*self.slot;
        let mut pending = lock.lock().unwrap_or_else(|e| e.into_inner());
        *pending = true;
        cvar.notify_one();
    }
}

impl DrdySemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifier(&self) -> DrdyNotifier {
        DrdyNotifier {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl ReadySignal for DrdySemaphore {
    fn await_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        let (lock, cvar) = &*self.slot;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (mut pending, _) = cvar
            .wait_timeout_while(guard, timeout, |pending| !*pending)
            .unwrap_or_else(|e| e.into_inner());
        if *pending {
            *pending = false;
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::TimedOut)
        }
    }

    fn clear(&mut self) {
        let (lock, _) = &*self.slot;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

// ============================================================================
// Polled Pin
// ============================================================================

/// Polls an active-low ready line.
pub struct PolledPin<P> {
    pin: P,
    interval: Duration,
}

impl<P: InputPin> PolledPin<P> {
    pub fn new(pin: P) -> Self {
        Self::with_interval(pin, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(pin: P, interval: Duration) -> Self {
        Self { pin, interval }
    }

    pub fn into_inner(self) -> P {
        self.pin
    }
}

impl<P: InputPin + Send> ReadySignal for PolledPin<P> {
    fn await_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        let deadline = Instant::now() + timeout;
        loop {
            let low = self
                .pin
                .is_low()
                .map_err(|e| DriverError::Transport(format!("ready line read: {e:?}")))?;
            if low {
                return Ok(Readiness::Ready);
            }
            if Instant::now() >= deadline {
                return Ok(Readiness::TimedOut);
            }
            thread::sleep(self.interval);
        }
    }
}

// ============================================================================
// Interrupt With Fallback
// ============================================================================

/// A ready line that can deliver falling-edge interrupts.
pub trait DrdyInterrupt {
    /// Call `notifier.signal()` from the handler on each falling edge.
    fn install(&mut self, notifier: DrdyNotifier) -> Result<()>;
}

/// Interrupt-backed ready signal. Holds the line so the handler stays registered.
pub struct InterruptReady<L> {
    _line: L,
    semaphore: DrdySemaphore,
}

impl<L: Send> ReadySignal for InterruptReady<L> {
    fn await_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        self.semaphore.await_ready(timeout)
    }

    fn clear(&mut self) {
        self.semaphore.clear()
    }
}

/// Prefer an edge interrupt on `line`; if the handler cannot be installed,
/// fall back to polling the same line.
pub fn interrupt_or_poll<L>(mut line: L, poll_interval: Duration) -> Box<dyn ReadySignal>
where
    L: DrdyInterrupt + InputPin + Send + 'static,
{
    let semaphore = DrdySemaphore::new();
    match line.install(semaphore.notifier()) {
        Ok(()) => {
            debug!("ready line: interrupt handler installed");
            Box::new(InterruptReady {
                _line: line,
                semaphore,
            })
        }
        Err(e) => {
            warn!("ready interrupt unavailable ({}), polling the line instead", e);
            Box::new(PolledPin::with_interval(line, poll_interval))
        }
    }
}
