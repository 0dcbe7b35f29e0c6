//! btleplug-backed radio transport.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
use crate::transport::{Advertisement, Link, NotificationStream, Transport};

const FIND_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// BlueZ reports a concurrent discovery as `org.bluez.Error.InProgress`.
fn is_scan_busy_error(e: &btleplug::Error) -> bool {
    let message = e.to_string();
    message.contains("InProgress") || message.contains("in progress")
}

fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// The address, or the platform identifier where addresses are hidden (macOS).
fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if address == "00:00:00:00:00:00" {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

fn connect_failure_reason(e: &btleplug::Error) -> ConnectionFailureReason {
    match e {
        btleplug::Error::TimedOut(_) => ConnectionFailureReason::Timeout,
        btleplug::Error::DeviceNotFound | btleplug::Error::NotConnected => {
            ConnectionFailureReason::OutOfRange
        }
        btleplug::Error::PermissionDenied => ConnectionFailureReason::Rejected,
        other => ConnectionFailureReason::BleError(other.to_string()),
    }
}

/// Run `lookup` every [`FIND_POLL_INTERVAL`] until it yields a value, errors,
/// or `limit` passes. Errors are returned, not propagated, so the caller can
/// clean up first.
async fn poll_for<T, F, Fut>(limit: Duration, mut lookup: F) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + limit;
    loop {
        match lookup().await {
            Ok(None) if Instant::now() < deadline => sleep(FIND_POLL_INTERVAL).await,
            other => return other,
        }
    }
}

fn same_address(a: &str, b: &str) -> bool {
    a.replace(':', "").eq_ignore_ascii_case(&b.replace(':', ""))
}

/// Transport over the host BLE stack.
#[derive(Debug)]
pub struct BtleTransport {
    manager: Manager,
}

impl BtleTransport {
    /// Connect to the platform BLE manager.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    /// Pick the adapter whose info starts with `hint`, else the first one.
    async fn adapter(&self, hint: Option<&str>) -> Result<(Adapter, String)> {
        let adapters = self.manager.adapters().await?;
        let mut first = None;

        for adapter in adapters {
            let info = adapter.adapter_info().await.unwrap_or_default();
            if let Some(hint) = hint
                && info.starts_with(hint)
            {
                return Ok((adapter, info));
            }
            if first.is_none() {
                first = Some((adapter, info));
            }
        }

        match (first, hint) {
            (Some((adapter, info)), Some(hint)) => {
                warn!("Adapter {} not found, using {}", hint, info);
                Ok((adapter, info))
            }
            (Some(found), None) => Ok(found),
            (None, _) => Err(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter)),
        }
    }

    async fn start_scan(adapter: &Adapter, label: &str) -> Result<()> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| {
                if is_scan_busy_error(&e) {
                    Error::scan_in_progress(label)
                } else {
                    Error::Bluetooth(e)
                }
            })
    }

    async fn match_peripheral(
        adapter: &Adapter,
        address: &str,
    ) -> Result<Option<(Peripheral, String)>> {
        for peripheral in adapter.peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let identifier = create_identifier(&props.address.to_string(), &peripheral.id());
            if same_address(&identifier, address) {
                debug!("Matched peripheral {}", identifier);
                return Ok(Some((peripheral, identifier)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for BtleTransport {
    type Link = BtleLink;

    async fn adapters(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for adapter in self.manager.adapters().await? {
            let info = adapter.adapter_info().await?;
            // "hci0 (usb:v1D6Bp0246d0540)" -> "hci0"
            let name = info.split_whitespace().next().unwrap_or(&info).to_string();
            names.push(name);
        }
        Ok(names)
    }

    #[tracing::instrument(skip(self))]
    async fn scan(&self, adapter: Option<&str>, duration: Duration) -> Result<Vec<Advertisement>> {
        let (adapter, label) = self.adapter(adapter).await?;
        info!("Scanning on {} for {:?}", label, duration);

        Self::start_scan(&adapter, &label).await?;
        sleep(duration).await;
        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan on {}: {}", label, e);
        }

        let mut heard = Vec::new();
        for peripheral in adapter.peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let address = create_identifier(&props.address.to_string(), &peripheral.id());
            heard.push(Advertisement::new(address, props.local_name.as_deref()));
        }
        Ok(heard)
    }

    #[tracing::instrument(skip(self))]
    async fn find(
        &self,
        adapter: Option<&str>,
        address: &str,
        limit: Duration,
    ) -> Result<BtleLink> {
        let (adapter, label) = self.adapter(adapter).await?;
        Self::start_scan(&adapter, &label).await?;

        let found = poll_for(limit, || Self::match_peripheral(&adapter, address)).await;

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan on {}: {}", label, e);
        }

        match found? {
            Some((peripheral, address)) => Ok(BtleLink::new(peripheral, address)),
            None => Err(Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
                duration: limit,
            })),
        }
    }
}

/// One peripheral driven over btleplug.
#[derive(Debug)]
pub struct BtleLink {
    peripheral: Peripheral,
    address: String,
    characteristics: RwLock<HashMap<Uuid, Characteristic>>,
}

impl BtleLink {
    fn new(peripheral: Peripheral, address: String) -> Self {
        Self {
            peripheral,
            address,
            characteristics: RwLock::new(HashMap::new()),
        }
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        if let Some(characteristic) = self.characteristics.read().await.get(&uuid) {
            return Ok(characteristic.clone());
        }
        Err(Error::characteristic_not_found(
            uuid.to_string(),
            self.peripheral.services().len(),
        ))
    }
}

#[async_trait]
impl Link for BtleLink {
    fn address(&self) -> &str {
        &self.address
    }

    #[tracing::instrument(skip(self), fields(address = %self.address))]
    async fn connect(&self, limit: Duration) -> Result<()> {
        let connected = match timeout(limit, async {
            self.peripheral.connect().await?;
            self.peripheral.discover_services().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(connect_failure_reason(&e)),
            Err(_) => Err(ConnectionFailureReason::Timeout),
        };

        if let Err(reason) = connected {
            // The radio link may be up even though service discovery failed.
            match timeout(CLEANUP_TIMEOUT, self.peripheral.disconnect()).await {
                Ok(Ok(())) => debug!("Closed half-open connection"),
                Ok(Err(e)) => debug!("Cleanup disconnect failed: {}", e),
                Err(_) => warn!("Cleanup disconnect timed out after {:?}", CLEANUP_TIMEOUT),
            }
            return Err(Error::connection_failed(Some(self.address.clone()), reason));
        }

        let services = self.peripheral.services();
        let mut cache = self.characteristics.write().await;
        cache.clear();
        for service in &services {
            for characteristic in &service.characteristics {
                cache.insert(characteristic.uuid, characteristic.clone());
            }
        }
        debug!(
            "Cached {} characteristics from {} services",
            cache.len(),
            services.len()
        );
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(address = %self.address))]
    async fn subscribe(&self, uuid: Uuid) -> Result<NotificationStream> {
        let characteristic = self.characteristic(uuid).await?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| Error::SubscribeFailed {
                uuid: uuid.to_string(),
                reason: e.to_string(),
            })?;

        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |n| futures::future::ready((n.uuid == uuid).then_some(n.value)))
            .boxed())
    }

    #[tracing::instrument(skip(self, data), fields(address = %self.address, len = data.len()))]
    async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(uuid).await?;
        self.peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(|e| Error::WriteFailed {
                uuid: uuid.to_string(),
                reason: e.to_string(),
            })
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    #[tracing::instrument(skip(self), fields(address = %self.address))]
    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
