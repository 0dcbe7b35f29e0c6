//! Radio transport abstraction.
//!
//! The supervisor and the scanner only talk to the radio through these two
//! traits, so they run unchanged over btleplug ([`crate::btle`]) or over the
//! scriptable fake in [`crate::mock`].

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;

/// Raw notification chunks, delivered in arrival order.
///
/// Chunk boundaries carry no meaning; a packet may span several chunks and
/// a chunk may hold several packets. The stream ends when the link drops.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// BLE address (or platform identifier where addresses are hidden).
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

impl Advertisement {
    /// Create an advertisement record.
    pub fn new(address: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_string),
        }
    }
}

/// Access to the host's BLE adapters.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection type produced by [`Transport::find`].
    type Link: Link + 'static;

    /// Names of the adapters available on this host.
    async fn adapters(&self) -> Result<Vec<String>>;

    /// Scan on one adapter (or the default one) for `duration`.
    ///
    /// A "scan already in progress" refusal must surface as
    /// [`crate::Error::ScanInProgress`] so the scanner can retry it.
    async fn scan(&self, adapter: Option<&str>, duration: Duration) -> Result<Vec<Advertisement>>;

    /// Locate one peripheral by address, scanning for at most `timeout`.
    async fn find(
        &self,
        adapter: Option<&str>,
        address: &str,
        timeout: Duration,
    ) -> Result<Self::Link>;
}

/// A single peripheral the supervisor drives.
#[async_trait]
pub trait Link: Send + Sync {
    /// Address of the peripheral.
    fn address(&self) -> &str;

    /// Open the connection and discover services within `timeout`.
    async fn connect(&self, timeout: Duration) -> Result<()>;

    /// Enable notifications on `characteristic`.
    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream>;

    /// Write `data` to `characteristic` and wait for the acknowledgement.
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Whether the transport still believes the link is up.
    async fn is_connected(&self) -> bool;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;
}
