//! Telemetry packet framing and delivery.
//!
//! Wire layout, all fields little-endian:
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 2    | elapsed time, ms, u16 (wraps at 65536)  |
//! | 2      | 2*N  | force per channel, i16, 0.1 unit / LSB  |
//!
//! With the plate's four channels a packet is 10 bytes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::errors::{DriverError, Result};

/// Physical units per LSB of an encoded force.
pub const FORCE_RESOLUTION: f32 = 0.1;

const LSB_PER_UNIT: f32 = 10.0;

/// Encoded size of the timestamp field.
pub const TIMESTAMP_LEN: usize = 2;

/// Packet length for `channels` force values.
pub const fn packet_len(channels: usize) -> usize {
    TIMESTAMP_LEN + 2 * channels
}

/// Fixed-point encode with saturation. NaN encodes as 0.
#[inline]
pub fn scale_force(value: f32) -> i16 {
    let scaled = (value * LSB_PER_UNIT).round();
    if scaled.is_nan() {
        0
    } else {
        scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }
}

// ============================================================================
// Packet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryPacket {
    pub elapsed_ms: u16,
    pub forces: Vec<i16>,
}

impl TelemetryPacket {
    /// Build a packet from a cycle's physical values. `elapsed_ms` is
    /// truncated to 16 bits.
    pub fn from_values(elapsed_ms: u64, values: &[f32]) -> Self {
        Self {
            elapsed_ms: elapsed_ms as u16,
            forces: values.iter().copied().map(scale_force).collect(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        packet_len(self.forces.len())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.elapsed_ms.to_le_bytes());
        for force in &self.forces {
            buf.extend_from_slice(&force.to_le_bytes());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TIMESTAMP_LEN || bytes.len() % 2 != 0 {
            return Err(DriverError::invalid(format!(
                "telemetry packet of {} bytes is malformed",
                bytes.len()
            )));
        }
        let elapsed_ms = u16::from_le_bytes([bytes[0], bytes[1]]);
        let forces = bytes[TIMESTAMP_LEN..]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { elapsed_ms, forces })
    }

    /// Force of `channel` in physical units.
    pub fn force(&self, channel: usize) -> Option<f32> {
        self.forces
            .get(channel)
            .map(|&f| f as f32 * FORCE_RESOLUTION)
    }
}

// ============================================================================
// Subscriber State
// ============================================================================

/// Connection and notification state of the remote subscriber.
///
/// Updated by the radio stack's event handlers, read by the acquisition task.
#[derive(Debug)]
pub struct SubscriberState {
    connected: AtomicBool,
    notifications: AtomicBool,
    connections: AtomicU32,
    sessions: AtomicU32,
}

impl SubscriberState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            notifications: AtomicBool::new(false),
            connections: AtomicU32::new(0),
            sessions: AtomicU32::new(0),
        }
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.connections.fetch_add(1, Ordering::Relaxed);
        debug!("subscriber connected");
    }

    /// Disconnecting also drops the notification subscription.
    pub fn disconnect(&self) {
        self.notifications.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        debug!("subscriber disconnected");
    }

    /// Enable notifications. Only valid on a live connection.
    pub fn subscribe(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(DriverError::NotReady(
                "cannot enable notifications without a connection".into(),
            ));
        }
        self.notifications.store(true, Ordering::SeqCst);
        debug!("notifications enabled");
        Ok(())
    }

    pub fn unsubscribe(&self) {
        self.notifications.store(false, Ordering::SeqCst);
        debug!("notifications disabled");
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connected and notifications enabled.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.is_connected() && self.notifications.load(Ordering::SeqCst)
    }

    /// A central connected and enabled notifications. Several centrals may
    /// hold sessions at once.
    pub fn begin_session(&self) {
        self.connect();
        self.sessions.fetch_add(1, Ordering::SeqCst);
        self.notifications.store(true, Ordering::SeqCst);
        debug!("notification session opened");
    }

    /// A central went away. The link counts as disconnected only once the
    /// last session ends. Returns the sessions still open.
    pub fn end_session(&self) -> u32 {
        let remaining = self
            .sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_or(0, |prev| prev - 1);
        if remaining == 0 {
            self.disconnect();
        }
        remaining
    }

    /// Notification sessions currently open.
    #[must_use]
    pub fn active_sessions(&self) -> u32 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Connections seen since startup.
    #[must_use]
    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Default for SubscriberState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Where encoded packets go.
pub trait TelemetrySink: Send {
    fn is_subscribed(&self) -> bool;

    fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Box<S> {
    fn is_subscribed(&self) -> bool {
        (**self).is_subscribed()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).send(bytes)
    }
}

/// Sink that logs every packet it receives. Subscribed whenever its
/// [`SubscriberState`] is, which is always for [`LoggingSink::always_on`].
#[derive(Debug)]
pub struct LoggingSink {
    state: Arc<SubscriberState>,
}

impl LoggingSink {
    pub fn new(state: Arc<SubscriberState>) -> Self {
        Self { state }
    }

    pub fn always_on() -> Self {
        let state = Arc::new(SubscriberState::new());
        state.connect();
        // A fresh connection always accepts a subscription.
        let _ = state.subscribe();
        Self { state }
    }

    pub fn state(&self) -> &Arc<SubscriberState> {
        &self.state
    }
}

impl TelemetrySink for LoggingSink {
    fn is_subscribed(&self) -> bool {
        self.state.is_subscribed()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let packet = TelemetryPacket::decode(bytes)?;
        let forces: Vec<f32> = (0..packet.forces.len())
            .filter_map(|ch| packet.force(ch))
            .collect();
        debug!("packet t={}ms forces={:?}", packet.elapsed_ms, forces);
        Ok(())
    }
}

// ============================================================================
// Framer
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub sent: u64,
    /// Dropped because nobody was subscribed.
    pub dropped: u64,
    /// Handed to the sink but the sink reported an error.
    pub failed: u64,
}

/// Frames cycles into packets and pushes them to a sink. Never queues:
/// a packet that cannot be delivered now is gone.
pub struct TelemetryFramer<S> {
    sink: S,
    stats: TelemetryStats,
}

impl<S: TelemetrySink> TelemetryFramer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            stats: TelemetryStats::default(),
        }
    }

    pub fn encode_packet(elapsed_ms: u64, values: &[f32]) -> TelemetryPacket {
        TelemetryPacket::from_values(elapsed_ms, values)
    }

    /// Deliver `packet` if a subscriber is listening, otherwise fail with
    /// `NotReady` without touching the sink's transport.
    pub fn notify(&mut self, packet: &TelemetryPacket) -> Result<()> {
        if !self.sink.is_subscribed() {
            self.stats.dropped += 1;
            trace!("no subscriber, packet t={}ms dropped", packet.elapsed_ms);
            return Err(DriverError::NotReady("no subscriber".into()));
        }
        match self.sink.send(&packet.encode()) {
            Ok(()) => {
                self.stats.sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!("telemetry send failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> TelemetryStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        subscribed: bool,
        sends: Vec<Vec<u8>>,
    }

    impl TelemetrySink for RecordingSink {
        fn is_subscribed(&self) -> bool {
            self.subscribed
        }

        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            self.sends.push(bytes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn four_channel_layout_is_ten_bytes() {
        let packet = TelemetryPacket::from_values(0x1234, &[1.0, -1.0, 0.3, 3276.7]);
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 10);
        assert_eq!(
            bytes,
            vec![0x34, 0x12, 0x0A, 0x00, 0xF6, 0xFF, 0x03, 0x00, 0xFF, 0x7F]
        );
    }

    #[test]
    fn out_of_range_forces_saturate() {
        assert_eq!(scale_force(4000.0), i16::MAX);
        assert_eq!(scale_force(-4000.0), i16::MIN);
        assert_eq!(scale_force(3276.7), 32767);
        assert_eq!(scale_force(-3276.8), -32768);
        assert_eq!(scale_force(f32::INFINITY), i16::MAX);
        assert_eq!(scale_force(f32::NAN), 0);
        assert_eq!(scale_force(-0.04), 0);
        assert_eq!(scale_force(12.34), 123);
    }

    #[test]
    fn every_scaled_value_survives_the_wire() {
        for v in i16::MIN..=i16::MAX {
            let packet = TelemetryPacket {
                elapsed_ms: v as u16,
                forces: vec![v, v.wrapping_neg(), 0, v],
            };
            assert_eq!(TelemetryPacket::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn elapsed_time_wraps() {
        let packet = TelemetryPacket::from_values(65_536 + 7, &[0.0]);
        assert_eq!(packet.elapsed_ms, 7);
    }

    #[test]
    fn malformed_packets_are_rejected() {
        assert!(TelemetryPacket::decode(&[0x01]).is_err());
        assert!(TelemetryPacket::decode(&[0, 0, 1]).is_err());
        assert_eq!(TelemetryPacket::decode(&[5, 0]).unwrap().forces.len(), 0);
    }

    #[test]
    fn notify_without_subscriber_never_sends() {
        let mut framer = TelemetryFramer::new(RecordingSink::default());
        let packet = TelemetryFramer::<RecordingSink>::encode_packet(10, &[1.0; 4]);
        for _ in 0..5 {
            let err = framer.notify(&packet).unwrap_err();
            assert!(matches!(err, DriverError::NotReady(_)));
        }
        assert!(framer.sink().sends.is_empty());
        assert_eq!(framer.stats().dropped, 5);
        assert_eq!(framer.stats().sent, 0);
    }

    #[test]
    fn notify_sends_when_subscribed() {
        let mut framer = TelemetryFramer::new(RecordingSink {
            subscribed: true,
            ..Default::default()
        });
        let packet = TelemetryFramer::<RecordingSink>::encode_packet(10, &[1.0; 4]);
        framer.notify(&packet).unwrap();
        assert_eq!(framer.sink().sends, vec![packet.encode()]);
        assert_eq!(framer.stats().sent, 1);
    }

    #[test]
    fn subscriber_transitions() {
        let state = SubscriberState::new();
        assert!(state.subscribe().is_err());
        state.connect();
        assert!(!state.is_subscribed());
        state.subscribe().unwrap();
        assert!(state.is_subscribed());
        state.unsubscribe();
        assert!(!state.is_subscribed());
        state.subscribe().unwrap();
        state.disconnect();
        assert!(!state.is_subscribed());
        state.connect();
        assert!(!state.is_subscribed());
        assert_eq!(state.connection_count(), 2);
    }

    #[test]
    fn subscription_survives_until_last_session_ends() {
        let state = SubscriberState::new();
        state.begin_session();
        state.begin_session();
        assert_eq!(state.active_sessions(), 2);
        assert_eq!(state.end_session(), 1);
        assert!(state.is_subscribed());
        assert_eq!(state.end_session(), 0);
        assert!(!state.is_subscribed());
        assert!(!state.is_connected());
        assert_eq!(state.end_session(), 0);
        assert_eq!(state.connection_count(), 2);
    }

    #[test]
    fn logging_sink_follows_state() {
        let state = Arc::new(SubscriberState::new());
        let mut framer = TelemetryFramer::new(LoggingSink::new(Arc::clone(&state)));
        let packet = TelemetryPacket::from_values(1, &[0.5]);
        assert!(framer.notify(&packet).is_err());
        state.connect();
        state.subscribe().unwrap();
        framer.notify(&packet).unwrap();
        assert!(LoggingSink::always_on().is_subscribed());
    }
}
