//! Discovery of Power Watchdog devices.
//!
//! [`discover`] scans each adapter once and classifies what it heard into
//! [`DiscoveredDevice`]s. It never fails: adapters that refuse or error are
//! skipped and the result simply has fewer devices. [`DiscoveryRunner`]
//! repeats that on an interval.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use power_watchdog_types::{DiscoveredDevice, classify};

use crate::error::{Error, Result};
use crate::retry::{RetryConfig, with_retry_if};
use crate::transport::{Advertisement, Transport};

/// Options for device discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryOptions {
    /// How long to scan on each adapter.
    pub scan_duration: Duration,
    /// Adapters to scan. Empty means every adapter the transport reports.
    pub adapters: Vec<String>,
    /// Retry policy for "scan already in progress" refusals.
    pub busy_retry: RetryConfig,
    /// Time between cycles for [`DiscoveryRunner`].
    pub interval: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(15),
            adapters: Vec::new(),
            busy_retry: RetryConfig::for_scan_busy(),
            interval: Duration::from_secs(60),
        }
    }
}

impl DiscoveryOptions {
    /// Create default discovery options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set scan duration.
    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Add an adapter to scan.
    #[must_use]
    pub fn adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapters.push(adapter.into());
        self
    }

    /// Set the busy retry policy.
    #[must_use]
    pub fn busy_retry(mut self, retry: RetryConfig) -> Self {
        self.busy_retry = retry;
        self
    }

    /// Set the runner interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.scan_duration.is_zero() {
            return Err(Error::invalid_config("scan_duration must be > 0"));
        }
        if self.interval.is_zero() {
            return Err(Error::invalid_config("interval must be > 0"));
        }
        self.busy_retry.validate()
    }
}

async fn resolve_adapters<T: Transport>(
    transport: &T,
    options: &DiscoveryOptions,
) -> Vec<Option<String>> {
    if !options.adapters.is_empty() {
        return options.adapters.iter().cloned().map(Some).collect();
    }
    match transport.adapters().await {
        Ok(names) if !names.is_empty() => names.into_iter().map(Some).collect(),
        Ok(_) => vec![None],
        Err(e) => {
            warn!("Could not list adapters, using default: {}", e);
            vec![None]
        }
    }
}

/// Scan every adapter once and return the Power Watchdogs heard.
///
/// Devices are deduplicated by address; the first adapter to hear a device
/// wins.
pub async fn discover<T: Transport>(
    transport: &T,
    options: &DiscoveryOptions,
) -> Vec<DiscoveredDevice> {
    let adapters = resolve_adapters(transport, options).await;
    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    for adapter in adapters {
        let label = adapter.as_deref().unwrap_or("default");
        let operation = format!("scan on {label}");
        let scanned = with_retry_if(&options.busy_retry, &operation, Error::is_scan_busy, || {
            transport.scan(adapter.as_deref(), options.scan_duration)
        })
        .await;

        let advertisements: Vec<Advertisement> = match scanned {
            Ok(advertisements) => advertisements,
            Err(e) => {
                warn!("Skipping adapter {}: {}", label, e);
                continue;
            }
        };
        debug!("{} advertisements on {}", advertisements.len(), label);

        for advertisement in advertisements {
            let Some(name) = advertisement.name.as_deref() else {
                continue;
            };
            let Some(device) = classify(name) else {
                continue;
            };
            if seen.insert(advertisement.address.clone()) {
                info!(
                    "Found Power Watchdog {} ({}, {}, {}) on {}",
                    name, device.generation, device.device_type, device.topology, label
                );
                devices.push(device.with_address(advertisement.address));
            }
        }
    }

    devices
}

/// Runs [`discover`] periodically.
///
/// Each cycle runs on its own task. A cycle that is still running when the
/// next tick fires causes that tick to be skipped.
#[derive(Debug)]
pub struct DiscoveryRunner {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryRunner {
    /// Start the runner. Results of each cycle arrive on the returned channel.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<T: Transport + 'static>(
        transport: Arc<T>,
        options: DiscoveryOptions,
    ) -> (Self, mpsc::Receiver<Vec<DiscoveredDevice>>) {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::run(transport, options, tx, cancel.clone()));
        (
            Self {
                cancel,
                task: Some(task),
            },
            rx,
        )
    }

    async fn run<T: Transport + 'static>(
        transport: Arc<T>,
        options: DiscoveryOptions,
        tx: mpsc::Sender<Vec<DiscoveredDevice>>,
        cancel: CancellationToken,
    ) {
        let options = Arc::new(options);
        let mut ticker = interval(options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycle: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if cycle.as_ref().is_some_and(|c| !c.is_finished()) {
                debug!("Previous discovery cycle still running, skipping");
                continue;
            }

            let transport = Arc::clone(&transport);
            let options = Arc::clone(&options);
            let tx = tx.clone();
            cycle = Some(tokio::spawn(async move {
                let devices = discover(transport.as_ref(), &options).await;
                if tx.send(devices).await.is_err() {
                    debug!("Discovery receiver dropped");
                }
            }));
        }

        if let Some(cycle) = cycle {
            cycle.abort();
        }
        debug!("Discovery runner stopped");
    }

    /// Stop the runner and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Discovery runner ended abnormally: {}", e);
        }
    }
}

impl Drop for DiscoveryRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = DiscoveryOptions::default();
        assert_eq!(options.scan_duration, Duration::from_secs(15));
        assert_eq!(options.interval, Duration::from_secs(60));
        assert!(options.adapters.is_empty());
        assert_eq!(options.busy_retry, RetryConfig::for_scan_busy());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_builder() {
        let options = DiscoveryOptions::new()
            .adapter("hci0")
            .adapter("hci1")
            .scan_duration(Duration::from_secs(5));
        assert_eq!(options.adapters, vec!["hci0", "hci1"]);
        assert_eq!(options.scan_duration, Duration::from_secs(5));
        assert!(options.interval(Duration::ZERO).validate().is_err());
    }
}
