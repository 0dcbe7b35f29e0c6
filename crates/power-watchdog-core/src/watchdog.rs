//! Link watchdog.
//!
//! A BLE link can look connected while nothing arrives. The watchdog is armed
//! for one streaming session and [`LinkWatchdog::starved`] resolves once no
//! feed has happened for the configured timeout. Only tail-valid packets
//! feed it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

#[derive(Debug, Default)]
struct Shared {
    notify: Notify,
    feeds: AtomicU64,
}

/// Liveness timer for one streaming session.
#[derive(Debug)]
pub struct LinkWatchdog {
    shared: Arc<Shared>,
    timeout: Duration,
}

/// Cheap handle used by the packet path to reset the watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogFeeder {
    shared: Arc<Shared>,
}

impl WatchdogFeeder {
    /// Reset the watchdog timer.
    pub fn feed(&self) {
        self.shared.feeds.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
    }
}

impl LinkWatchdog {
    /// Arm a watchdog with the given starvation timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            timeout,
        }
    }

    /// The starvation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of feeds since the watchdog was armed.
    pub fn feeds(&self) -> u64 {
        self.shared.feeds.load(Ordering::Relaxed)
    }

    /// A feeder bound to this watchdog.
    pub fn feeder(&self) -> WatchdogFeeder {
        WatchdogFeeder {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Resolve once `timeout` passes without a feed.
    ///
    /// A feed that lands while nobody is waiting is kept as a permit, so a
    /// packet decoded between polls still counts.
    pub async fn starved(&self) {
        while timeout(self.timeout, self.shared.notify.notified())
            .await
            .is_ok()
        {}
    }
}
