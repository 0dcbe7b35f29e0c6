//! Measurement store shared between a supervisor worker and its readers.
//!
//! The worker is the only writer. Readers get a deep copy so their view does
//! not change under them. The store outlives individual connections, so a
//! reconnect only flips `connected`; the last values stay readable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use time::OffsetDateTime;

use power_watchdog_types::{DlReport, WatchdogSnapshot};

#[derive(Debug, Default)]
struct Inner {
    snapshot: Mutex<WatchdogSnapshot>,
    connected: AtomicBool,
}

/// Cloneable handle to one device's latest snapshot.
#[derive(Debug, Clone, Default)]
pub struct MeasurementStore {
    inner: Arc<Inner>,
}

impl MeasurementStore {
    /// Create an empty store (not ready, not connected).
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WatchdogSnapshot> {
        // `apply` only assigns fields, so a poisoned snapshot is still whole.
        self.inner
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the latest snapshot.
    pub fn snapshot(&self) -> WatchdogSnapshot {
        self.lock().clone()
    }

    /// Record a decoded report.
    pub fn apply(&self, report: &DlReport, raw: &[u8]) {
        self.apply_at(report, raw, OffsetDateTime::now_utc());
    }

    /// Record a decoded report with an explicit timestamp.
    pub fn apply_at(&self, report: &DlReport, raw: &[u8], at: OffsetDateTime) {
        self.lock().apply(report, raw, at);
    }

    /// Whether the link is currently streaming.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Set the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use power_watchdog_types::LineMeasurement;

    fn report(voltage: f64) -> DlReport {
        DlReport::Single(LineMeasurement {
            input_voltage: voltage,
            ..LineMeasurement::default()
        })
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = MeasurementStore::new();
        assert!(!store.connected());
        assert!(!store.snapshot().is_ready());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = MeasurementStore::new();
        store.apply(&report(120.0), &[0x01]);
        let before = store.snapshot();

        store.apply(&report(118.0), &[0x02]);
        assert_eq!(before.line1.input_voltage, 120.0);
        assert_eq!(before.raw_hex, "01");
        assert_eq!(store.snapshot().line1.input_voltage, 118.0);
    }

    #[test]
    fn test_clones_share_state() {
        let store = MeasurementStore::new();
        let reader = store.clone();
        store.set_connected(true);
        store.apply(&report(121.0), &[]);
        assert!(reader.connected());
        assert!(reader.snapshot().is_ready());

        store.set_connected(false);
        assert!(!reader.connected());
        assert!(reader.snapshot().is_ready());
    }

    #[test]
    fn test_concurrent_readers() {
        let store = MeasurementStore::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reader = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let snapshot = reader.snapshot();
                        assert!(snapshot.line1.input_voltage >= 0.0);
                    }
                })
            })
            .collect();

        for i in 0..100 {
            store.apply(&report(f64::from(i)), &[]);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.snapshot().line1.input_voltage, 99.0);
    }
}
