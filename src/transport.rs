//! The GATT transport consumed by the session manager.
//!
//! [`GattTransport`] is the seam between the session's logic and the BLE
//! stack: one exclusively-owned link to one peripheral, addressed entirely
//! through [`PuckCharacteristic`]. Production code uses
//! [`BtleplugTransport`]; session tests script the trait directly.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use log::warn;
use uuid::Uuid;

use crate::error::{PuckError, Result};
use crate::protocol::PuckCharacteristic;

/// One characteristic value pushed by the peripheral.
#[derive(Debug, Clone)]
pub struct Notification {
    /// UUID of the characteristic that produced the value.
    pub uuid: Uuid,
    /// Raw payload bytes.
    pub value: Vec<u8>,
}

/// A connected-mode BLE client for a single peripheral.
///
/// Exactly one session owns a transport; no two sessions may drive the same
/// physical link. Every method is a suspension point awaiting I/O completion.
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Establish the link and discover the peripheral's GATT services.
    async fn connect(&self) -> Result<()>;

    /// Release the link. A no-op success when already disconnected.
    async fn disconnect(&self) -> Result<()>;

    /// Read the current value of a characteristic.
    async fn read(&self, characteristic: PuckCharacteristic) -> Result<Vec<u8>>;

    /// Write a payload to a characteristic.
    async fn write(
        &self,
        characteristic: PuckCharacteristic,
        payload: &[u8],
        mode: WriteType,
    ) -> Result<()>;

    /// Enable notifications for a characteristic.
    async fn subscribe(&self, characteristic: PuckCharacteristic) -> Result<()>;

    /// The merged stream of notifications from every subscribed
    /// characteristic. The stream ends when the link drops.
    async fn notifications(&self) -> Result<BoxStream<'static, Notification>>;

    /// Current signal strength in dBm.
    async fn rssi(&self) -> Result<i16>;

    /// Resolves when the stack reports the link has dropped out from under
    /// us (peripheral powered off, out of range). Never resolves for an
    /// orderly [`disconnect`](GattTransport::disconnect).
    async fn closed(&self);
}

// ── btleplug implementation ───────────────────────────────────────────────────

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// [`GattTransport`] over a `btleplug` peripheral.
pub struct BtleplugTransport {
    peripheral: Peripheral,
    /// Kept so [`closed`](GattTransport::closed) can watch for disconnect
    /// events on the adapter that discovered this peripheral.
    adapter: Adapter,
}

impl BtleplugTransport {
    pub fn new(peripheral: Peripheral, adapter: Adapter) -> Self {
        Self {
            peripheral,
            adapter,
        }
    }

    /// Look up the platform characteristic for a profile entry.
    ///
    /// Only valid after service discovery, i.e. after
    /// [`connect`](GattTransport::connect) has returned.
    fn resolve(&self, characteristic: PuckCharacteristic) -> Result<Characteristic> {
        let uuid = characteristic.uuid();
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(PuckError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn connect(&self) -> Result<()> {
        // Hard timeout: BlueZ's Connect can block forever when the device is
        // out of range or the stack is in a bad state. Ten seconds is
        // generous for a link that typically comes up in under two.
        tokio::time::timeout(CONNECT_TIMEOUT, self.peripheral.connect())
            .await
            .map_err(|_| btleplug::Error::TimedOut(CONNECT_TIMEOUT))??;

        // On Linux the stack signals connection completion before the GATT
        // cache is populated; discovering too quickly returns an empty set
        // and every later resolve() fails. A short pause lets BlueZ finish.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVERY_TIMEOUT, self.peripheral.discover_services())
            .await
            .map_err(|_| btleplug::Error::TimedOut(DISCOVERY_TIMEOUT))??;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn read(&self, characteristic: PuckCharacteristic) -> Result<Vec<u8>> {
        let c = self.resolve(characteristic)?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(
        &self,
        characteristic: PuckCharacteristic,
        payload: &[u8],
        mode: WriteType,
    ) -> Result<()> {
        let c = self.resolve(characteristic)?;
        Ok(self.peripheral.write(&c, payload, mode).await?)
    }

    async fn subscribe(&self, characteristic: PuckCharacteristic) -> Result<()> {
        let c = self.resolve(characteristic)?;
        Ok(self.peripheral.subscribe(&c).await?)
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        let stream: Pin<Box<dyn Stream<Item = btleplug::api::ValueNotification> + Send>> =
            self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn rssi(&self) -> Result<i16> {
        // btleplug has no dedicated connected-mode RSSI query; the adapter
        // keeps the peripheral's last known value in its properties.
        self.peripheral
            .properties()
            .await?
            .and_then(|p| p.rssi)
            .ok_or(PuckError::RssiUnavailable)
    }

    async fn closed(&self) {
        let id = self.peripheral.id();
        match self.adapter.events().await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(dev) = event {
                        if dev == id {
                            return;
                        }
                    }
                }
                // Event stream ended: the adapter itself went away, which
                // drops the link with it.
            }
            Err(e) => {
                warn!("Could not watch adapter events for disconnects: {e}");
                std::future::pending::<()>().await;
            }
        }
    }
}
