//! BLE GATT telemetry sink (BlueZ via `bluer`).
//!
//! Advertises the plate, serves one primary service with a single notify
//! characteristic and forwards packets to whoever subscribes. Delivery goes
//! through a `watch` channel, so a slow subscriber only ever sees the newest
//! packet; nothing queues behind it.

use std::sync::Arc;
use std::time::Duration;

use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, Service,
};
use bluer::{Adapter, Session, Uuid};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::runtime::Runtime;
use tokio::sync::watch;

use crate::errors::{BluetoothError, DriverError, Result};
use crate::telemetry::{SubscriberState, TelemetrySink};

/// 16-bit SIG UUID expanded onto the Bluetooth base UUID.
const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

pub const FORCE_SERVICE_UUID: Uuid = sig_uuid(0x1815);
pub const FORCE_CHARACTERISTIC_UUID: Uuid = sig_uuid(0x2A58);

const DEFAULT_DEVICE_NAME: &str = "ZPlate";
const MAX_SETUP_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;
/// How often an idle subscriber task checks whether the central went away.
const STOP_POLL: Duration = Duration::from_millis(500);

/// Peripheral settings.
#[derive(Debug, Clone)]
pub struct BlePeripheral {
    pub device_name: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BlePeripheral {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.into(),
            max_retries: MAX_SETUP_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl BlePeripheral {
    /// Bring up the adapter, register the GATT application and start
    /// advertising. The returned server must be kept alive for as long as
    /// the sink is in use.
    pub fn start(&self) -> Result<(BleSink, BleServer)> {
        let runtime = Runtime::new()
            .map_err(|e| BluetoothError::Adapter(format!("tokio runtime init failed: {e}")))?;
        let state = Arc::new(SubscriberState::new());
        let (tx, rx) = watch::channel(Vec::new());

        let mut last_error = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying BLE setup after {:?} (name={}, attempt={})",
                    delay, self.device_name, attempt
                );
                std::thread::sleep(delay);
            }
            match runtime.block_on(self.serve(Arc::clone(&state), rx.clone())) {
                Ok((adapter, app, adv)) => {
                    info!(
                        "advertising as {:?} on {} (service {})",
                        self.device_name,
                        adapter.name(),
                        FORCE_SERVICE_UUID
                    );
                    let sink = BleSink {
                        state: Arc::clone(&state),
                        tx,
                    };
                    let server = BleServer {
                        _adv: adv,
                        _app: app,
                        _adapter: adapter,
                        state,
                        runtime,
                    };
                    return Ok((sink, server));
                }
                Err(e) => {
                    warn!("BLE setup attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DriverError::Bluetooth(BluetoothError::Adapter("max retries exceeded".into()))
        }))
    }

    async fn serve(
        &self,
        state: Arc<SubscriberState>,
        rx: watch::Receiver<Vec<u8>>,
    ) -> Result<(Adapter, ApplicationHandle, AdvertisementHandle)> {
        let session = Session::new()
            .await
            .map_err(|e| BluetoothError::Adapter(e.to_string()))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| BluetoothError::Adapter(e.to_string()))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| BluetoothError::Adapter(e.to_string()))?;

        let app = Application {
            services: vec![Service {
                uuid: FORCE_SERVICE_UUID,
                primary: true,
                characteristics: vec![force_characteristic(state, rx)],
                ..Default::default()
            }],
            ..Default::default()
        };
        let app_handle = adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| BluetoothError::Gatt(e.to_string()))?;

        let advertisement = Advertisement {
            service_uuids: [FORCE_SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(self.device_name.clone()),
            ..Default::default()
        };
        let adv_handle = adapter
            .advertise(advertisement)
            .await
            .map_err(|e| BluetoothError::Advertising(e.to_string()))?;

        Ok((adapter, app_handle, adv_handle))
    }
}

fn force_characteristic(
    state: Arc<SubscriberState>,
    rx: watch::Receiver<Vec<u8>>,
) -> Characteristic {
    Characteristic {
        uuid: FORCE_CHARACTERISTIC_UUID,
        notify: Some(CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let state = Arc::clone(&state);
                let rx = rx.clone();
                async move {
                    tokio::spawn(stream_to(notifier, state, rx));
                }
                .boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Forward the newest packet to one subscriber until it goes away.
async fn stream_to(
    mut notifier: CharacteristicNotifier,
    state: Arc<SubscriberState>,
    mut rx: watch::Receiver<Vec<u8>>,
) {
    state.begin_session();
    info!(
        "subscriber enabled notifications ({} active)",
        state.active_sessions()
    );

    while !notifier.is_stopped() {
        match tokio::time::timeout(STOP_POLL, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => continue,
        }
        let packet = rx.borrow_and_update().clone();
        if let Err(e) = notifier.notify(packet).await {
            debug!("notify failed, dropping subscriber: {}", e);
            break;
        }
    }

    let remaining = state.end_session();
    info!("subscriber gone ({} still active)", remaining);
}

/// Keeps the GATT application, the advertisement and their runtime alive.
pub struct BleServer {
    _adv: AdvertisementHandle,
    _app: ApplicationHandle,
    _adapter: Adapter,
    state: Arc<SubscriberState>,
    // Dropped last so the handles above can unregister.
    runtime: Runtime,
}

impl BleServer {
    pub fn subscriber(&self) -> &Arc<SubscriberState> {
        &self.state
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

/// [`TelemetrySink`] side of the peripheral.
pub struct BleSink {
    state: Arc<SubscriberState>,
    tx: watch::Sender<Vec<u8>>,
}

impl TelemetrySink for BleSink {
    fn is_subscribed(&self) -> bool {
        self.state.is_subscribed()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.tx.is_closed() {
            return Err(BluetoothError::Notify("gatt application is gone".into()).into());
        }
        self.tx.send_replace(bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_expand_onto_base() {
        assert_eq!(
            FORCE_SERVICE_UUID.to_string(),
            "00001815-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            FORCE_CHARACTERISTIC_UUID.to_string(),
            "00002a58-0000-1000-8000-00805f9b34fb"
        );
    }
}
