//! Mock transport for testing.
//!
//! [`MockTransport`] and [`MockLink`] implement the transport traits without
//! hardware. Tests script what scans return, inject failures per stage, push
//! notification chunks, and simulate a dropped link.
//!
//! ```
//! use std::sync::Arc;
//! use power_watchdog_core::{MockTransport, SupervisorConfig, ConnectionSupervisor};
//!
//! # async fn example() {
//! let transport = MockTransport::new();
//! let link = transport.add_device("24:DC:C3:00:11:22");
//!
//! let supervisor = ConnectionSupervisor::new(
//!     Arc::new(transport),
//!     SupervisorConfig::new("24:DC:C3:00:11:22"),
//! )
//! .unwrap();
//! let mut handle = supervisor.spawn();
//! // push packets with `link.notify(..)`
//! # let _ = link;
//! handle.stop(std::time::Duration::from_secs(1)).await;
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use uuid::Uuid;

use crate::error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
use crate::transport::{Advertisement, Link, NotificationStream, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Stage of a connection attempt that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStage {
    /// [`Transport::find`]: the device is not found.
    Find,
    /// [`Link::connect`]: the device refuses the connection.
    Connect,
    /// [`Link::connect`]: the radio connects but service discovery times out,
    /// leaving the peripheral connected.
    Discover,
    /// [`Link::subscribe`].
    Subscribe,
    /// The handshake [`Link::write`].
    Handshake,
}

/// Scripted result of one [`Transport::scan`] call.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// Return these advertisements.
    Found(Vec<Advertisement>),
    /// Refuse with [`Error::ScanInProgress`].
    Busy,
    /// Fail with a non-retryable error.
    Fail,
}

#[derive(Default)]
struct LinkState {
    connected: AtomicBool,
    visible: AtomicBool,
    failures: Mutex<HashMap<MockStage, u32>>,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    disconnect_delay: Mutex<Duration>,
}

/// A scriptable fake peripheral.
///
/// Clones share state, so a test keeps one clone to drive the device while
/// the supervisor owns another.
#[derive(Clone)]
pub struct MockLink {
    address: String,
    state: Arc<LinkState>,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("address", &self.address)
            .field("connected", &self.state.connected.load(Ordering::Relaxed))
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl MockLink {
    fn new(address: &str) -> Self {
        let state = LinkState::default();
        state.visible.store(true, Ordering::Relaxed);
        Self {
            address: address.to_string(),
            state: Arc::new(state),
        }
    }

    /// Fail the next `count` attempts at `stage`.
    pub fn fail_next(&self, stage: MockStage, count: u32) {
        lock(&self.state.failures).insert(stage, count);
    }

    fn take_failure(&self, stage: MockStage) -> bool {
        let mut failures = lock(&self.state.failures);
        match failures.get_mut(&stage) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Make the device visible or invisible to [`Transport::find`].
    pub fn set_visible(&self, visible: bool) {
        self.state.visible.store(visible, Ordering::Relaxed);
    }

    /// Make [`Link::disconnect`] take this long.
    pub fn set_disconnect_delay(&self, delay: Duration) {
        *lock(&self.state.disconnect_delay) = delay;
    }

    /// Deliver one notification chunk.
    ///
    /// Returns `false` if nobody is subscribed.
    pub fn notify(&self, chunk: impl Into<Vec<u8>>) -> bool {
        match lock(&self.state.subscriber).as_ref() {
            Some(tx) => tx.unbounded_send(chunk.into()).is_ok(),
            None => false,
        }
    }

    /// Simulate the link going down without the stream closing.
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::Relaxed);
    }

    /// End the current notification stream.
    pub fn close_stream(&self) {
        lock(&self.state.subscriber).take();
    }

    /// Whether a notification stream is open.
    pub fn is_subscribed(&self) -> bool {
        lock(&self.state.subscriber)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u32 {
        self.state.connect_count.load(Ordering::Relaxed)
    }

    /// Number of disconnect calls.
    pub fn disconnect_count(&self) -> u32 {
        self.state.disconnect_count.load(Ordering::Relaxed)
    }

    /// Every write so far.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.state.writes).clone()
    }
}

#[async_trait]
impl Link for MockLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self, _timeout: Duration) -> Result<()> {
        if self.take_failure(MockStage::Connect) {
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::Rejected,
            ));
        }
        self.state.connected.store(true, Ordering::Relaxed);
        if self.take_failure(MockStage::Discover) {
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::Timeout,
            ));
        }
        self.state.connect_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream> {
        if !self.state.connected.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }
        if self.take_failure(MockStage::Subscribe) {
            return Err(Error::SubscribeFailed {
                uuid: characteristic.to_string(),
                reason: "mock failure".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded();
        *lock(&self.state.subscriber) = Some(tx);
        Ok(rx.boxed())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        if !self.state.connected.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }
        if self.take_failure(MockStage::Handshake) {
            return Err(Error::WriteFailed {
                uuid: characteristic.to_string(),
                reason: "mock failure".to_string(),
            });
        }
        lock(&self.state.writes).push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Relaxed)
    }

    async fn disconnect(&self) -> Result<()> {
        let delay = *lock(&self.state.disconnect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.disconnect_count.fetch_add(1, Ordering::Relaxed);
        self.state.connected.store(false, Ordering::Relaxed);
        self.close_stream();
        Ok(())
    }
}

#[derive(Default)]
struct TransportState {
    adapters: Vec<String>,
    devices: Mutex<HashMap<String, MockLink>>,
    advertisements: Mutex<HashMap<Option<String>, Vec<Advertisement>>>,
    scripted: Mutex<HashMap<Option<String>, VecDeque<ScanOutcome>>>,
    scan_count: AtomicU32,
    find_count: AtomicU32,
}

/// A scriptable fake radio.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("adapters", &self.state.adapters)
            .field("devices", &lock(&self.state.devices).len())
            .finish()
    }
}

impl MockTransport {
    /// A transport with one unnamed default adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport reporting these adapter names.
    pub fn with_adapters<I, S>(adapters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(TransportState {
                adapters: adapters.into_iter().map(Into::into).collect(),
                ..Default::default()
            }),
        }
    }

    /// Register a connectable device and return its control handle.
    pub fn add_device(&self, address: &str) -> MockLink {
        let link = MockLink::new(address);
        lock(&self.state.devices).insert(address.to_string(), link.clone());
        link
    }

    /// Add an advertisement every scan on `adapter` will report.
    pub fn advertise(&self, adapter: Option<&str>, address: &str, name: &str) {
        lock(&self.state.advertisements)
            .entry(adapter.map(str::to_string))
            .or_default()
            .push(Advertisement::new(address, Some(name)));
    }

    /// Queue a one-shot outcome for the next scan on `adapter`.
    ///
    /// Scripted outcomes take precedence over advertisements.
    pub fn script_scan(&self, adapter: Option<&str>, outcome: ScanOutcome) {
        lock(&self.state.scripted)
            .entry(adapter.map(str::to_string))
            .or_default()
            .push_back(outcome);
    }

    /// Number of scan calls.
    pub fn scan_count(&self) -> u32 {
        self.state.scan_count.load(Ordering::Relaxed)
    }

    /// Number of find calls.
    pub fn find_count(&self) -> u32 {
        self.state.find_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn adapters(&self) -> Result<Vec<String>> {
        Ok(self.state.adapters.clone())
    }

    async fn scan(&self, adapter: Option<&str>, duration: Duration) -> Result<Vec<Advertisement>> {
        self.state.scan_count.fetch_add(1, Ordering::Relaxed);
        let key = adapter.map(str::to_string);
        let label = adapter.unwrap_or("default");

        let scripted = lock(&self.state.scripted)
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(ScanOutcome::Busy) => return Err(Error::scan_in_progress(label)),
            Some(ScanOutcome::Fail) => {
                return Err(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter));
            }
            Some(ScanOutcome::Found(found)) => {
                tokio::time::sleep(duration).await;
                return Ok(found);
            }
            None => {}
        }

        tokio::time::sleep(duration).await;
        let heard = lock(&self.state.advertisements)
            .get(&key)
            .cloned()
            .unwrap_or_default();
        Ok(heard)
    }

    async fn find(
        &self,
        _adapter: Option<&str>,
        address: &str,
        timeout: Duration,
    ) -> Result<MockLink> {
        self.state.find_count.fetch_add(1, Ordering::Relaxed);
        let link = lock(&self.state.devices).get(address).cloned();

        match link {
            Some(link)
                if link.state.visible.load(Ordering::Relaxed)
                    && !link.take_failure(MockStage::Find) =>
            {
                Ok(link)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
                    duration: timeout,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_requires_connect() {
        let transport = MockTransport::new();
        let link = transport.add_device("AA");
        let found = transport
            .find(None, "AA", Duration::from_secs(1))
            .await
            .unwrap();

        let uuid = Uuid::nil();
        assert!(matches!(found.write(uuid, b"x").await, Err(Error::NotConnected)));
        found.connect(Duration::from_secs(1)).await.unwrap();
        found.write(uuid, b"x").await.unwrap();
        assert_eq!(link.writes(), vec![(uuid, b"x".to_vec())]);
        assert_eq!(link.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_counts_down() {
        let transport = MockTransport::new();
        let link = transport.add_device("AA");
        link.fail_next(MockStage::Connect, 2);

        assert!(link.connect(Duration::from_secs(1)).await.is_err());
        assert!(link.connect(Duration::from_secs(1)).await.is_err());
        assert!(link.connect(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_discover_failure_leaves_link_connected() {
        let transport = MockTransport::new();
        let link = transport.add_device("AA");
        link.fail_next(MockStage::Discover, 1);

        assert!(link.connect(Duration::from_secs(1)).await.is_err());
        assert!(link.is_connected().await);
        assert_eq!(link.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_missing_waits_for_timeout() {
        let transport = MockTransport::new();
        let start = tokio::time::Instant::now();
        let result = transport.find(None, "AA", Duration::from_secs(20)).await;
        assert!(matches!(result, Err(Error::DeviceNotFound(_))));
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_notifications_flow_until_disconnect() {
        let transport = MockTransport::new();
        let link = transport.add_device("AA");
        assert!(!link.notify(vec![1]));

        link.connect(Duration::from_secs(1)).await.unwrap();
        let mut stream = link.subscribe(Uuid::nil()).await.unwrap();
        assert!(link.notify(vec![1, 2]));
        assert_eq!(stream.next().await, Some(vec![1, 2]));

        link.disconnect().await.unwrap();
        assert_eq!(stream.next().await, None);
        assert!(!link.is_subscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_scans_precede_advertisements() {
        let transport = MockTransport::with_adapters(["hci0"]);
        transport.advertise(Some("hci0"), "AA", "WD_E7_26ec4ae469a5");
        transport.script_scan(Some("hci0"), ScanOutcome::Busy);

        let first = transport
            .scan(Some("hci0"), Duration::from_secs(1))
            .await;
        assert!(first.unwrap_err().is_scan_busy());

        let second = transport
            .scan(Some("hci0"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(transport.scan_count(), 2);
    }
}
