//! Peripheral discovery.
//!
//! Scanning takes an explicit [`ScanConfig`] value — there is no process-wide
//! scanner state. The default filter matches on the puck's movement service,
//! so unrelated peripherals never surface.

use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::info;
use uuid::Uuid;

use crate::error::{PuckError, Result};
use crate::protocol::MOVEMENT_SERVICE;
use crate::session::{PuckSession, SessionConfig};
use crate::transport::BtleplugTransport;

/// Configuration for one scan invocation.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How long to scan before giving up (or, for
    /// [`PuckScanner::scan_all`], before returning everything found).
    pub scan_timeout: Duration,
    /// Advertised service to filter on. Defaults to the movement service;
    /// `None` scans unfiltered.
    pub service_filter: Option<Uuid>,
    /// Only accept peripherals whose advertised name starts with this.
    pub name_prefix: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(15),
            service_filter: Some(MOVEMENT_SERVICE),
            name_prefix: None,
        }
    }
}

/// A puck discovered during a scan. Build a session from it with
/// [`into_session`](PuckDevice::into_session).
pub struct PuckDevice {
    /// Advertised device name, or `"Unknown"` when none was broadcast.
    pub name: String,
    /// Platform BLE identifier: a UUID string on macOS/Windows, a MAC
    /// address on Linux.
    pub id: String,
    peripheral: Peripheral,
    adapter: Adapter,
}

impl PuckDevice {
    /// Consume the discovery result into a session owning this peripheral.
    pub fn into_session(self, config: SessionConfig) -> PuckSession {
        let transport = BtleplugTransport::new(self.peripheral, self.adapter);
        PuckSession::new(Arc::new(transport), config)
    }
}

/// Discovers pucks with the filter and timeout of its [`ScanConfig`].
pub struct PuckScanner {
    config: ScanConfig,
}

impl PuckScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Scan for the full timeout and return every matching puck, so several
    /// devices in range can all be discovered in one pass.
    pub async fn scan_all(&self) -> Result<Vec<PuckDevice>> {
        let adapter = default_adapter().await?;

        info!("Scanning for {:?} …", self.config.scan_timeout);
        adapter.start_scan(self.filter()).await?;
        tokio::time::sleep(self.config.scan_timeout).await;
        adapter.stop_scan().await.ok();

        let mut found = Vec::new();
        for p in adapter.peripherals().await? {
            if let Some(device) = self.accept(p, &adapter).await {
                info!("Found {} ({})", device.name, device.id);
                found.push(device);
            }
        }
        info!("{} puck(s) found", found.len());
        Ok(found)
    }

    /// Scan until the first matching puck appears, or fail with
    /// [`PuckError::ScanTimeout`] once the timeout expires.
    pub async fn find_first(&self) -> Result<PuckDevice> {
        let adapter = default_adapter().await?;

        adapter.start_scan(self.filter()).await?;
        let result = tokio::time::timeout(self.config.scan_timeout, async {
            loop {
                for p in adapter.peripherals().await.unwrap_or_default() {
                    if let Some(device) = self.accept(p, &adapter).await {
                        return device;
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await;
        adapter.stop_scan().await.ok();

        result.map_err(|_| PuckError::ScanTimeout(self.config.scan_timeout))
    }

    fn filter(&self) -> ScanFilter {
        ScanFilter {
            services: self.config.service_filter.into_iter().collect(),
        }
    }

    /// Apply the name filter and wrap a peripheral into a [`PuckDevice`].
    async fn accept(&self, peripheral: Peripheral, adapter: &Adapter) -> Option<PuckDevice> {
        let props = peripheral.properties().await.ok()??;
        let name = props.local_name.unwrap_or_else(|| "Unknown".into());
        if let Some(prefix) = &self.config.name_prefix {
            if !name.starts_with(prefix.as_str()) {
                return None;
            }
        }
        let id = peripheral.id().to_string();
        Some(PuckDevice {
            name,
            id,
            peripheral,
            adapter: adapter.clone(),
        })
    }
}

/// First available Bluetooth adapter, ready to scan.
async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(PuckError::NoAdapter)?;

    // macOS: CBCentralManager starts in an "unknown" state after launch;
    // scanning before it reaches PoweredOn is a silent no-op. Poll briefly
    // and proceed either way.
    #[cfg(target_os = "macos")]
    {
        use btleplug::api::CentralState;
        use log::{debug, warn};

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => break,
                Ok(state) => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("Adapter still in state {state:?} after 3 s — proceeding anyway");
                        break;
                    }
                    debug!("Adapter state = {state:?}, waiting…");
                }
                Err(e) => {
                    warn!("adapter_state() error: {e}");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        // Let the delegate settle.
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    Ok(adapter)
}
