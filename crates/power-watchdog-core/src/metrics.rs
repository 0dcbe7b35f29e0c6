//! Protocol and link counters.
//!
//! One [`LinkMetrics`] is shared between a supervisor worker and its handle.
//! The worker increments, the handle reads a [`LinkMetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of [`LinkMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetricsSnapshot {
    /// Notification bytes received.
    pub bytes_received: u64,
    /// DLReport packets decoded into the store.
    pub packets_decoded: u64,
    /// Packets dropped for a bad tail.
    pub bad_tails: u64,
    /// Headers dropped for an oversized declared length.
    pub oversized_lengths: u64,
    /// Times the reassembly buffer overflowed and was cleared.
    pub buffer_overflows: u64,
    /// DLReport packets with a body that was neither 34 nor 68 bytes.
    pub unexpected_body_lengths: u64,
    /// ErrorReport packets received.
    pub error_reports: u64,
    /// Alarm packets received.
    pub alarms: u64,
    /// Packets with an unrecognized command.
    pub unknown_commands: u64,
    /// Connection attempts started (one per scan).
    pub connection_attempts: u64,
    /// Attempts that reached streaming.
    pub sessions: u64,
    /// Sessions ended by the link watchdog.
    pub watchdog_expirations: u64,
}

/// Thread-safe counters for one supervised device.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    bytes_received: AtomicU64,
    packets_decoded: AtomicU64,
    bad_tails: AtomicU64,
    oversized_lengths: AtomicU64,
    buffer_overflows: AtomicU64,
    unexpected_body_lengths: AtomicU64,
    error_reports: AtomicU64,
    alarms: AtomicU64,
    unknown_commands: AtomicU64,
    connection_attempts: AtomicU64,
    sessions: AtomicU64,
    watchdog_expirations: AtomicU64,
}

macro_rules! counter {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increment `", stringify!($field), "`.")]
            pub fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl LinkMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_packet_decoded => packets_decoded,
        record_bad_tail => bad_tails,
        record_oversized_length => oversized_lengths,
        record_buffer_overflow => buffer_overflows,
        record_unexpected_body_length => unexpected_body_lengths,
        record_error_report => error_reports,
        record_alarm => alarms,
        record_unknown_command => unknown_commands,
        record_connection_attempt => connection_attempts,
        record_session => sessions,
        record_watchdog_expiration => watchdog_expirations,
    }

    /// Add received notification bytes.
    pub fn record_bytes(&self, count: usize) {
        self.bytes_received
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        LinkMetricsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_decoded: self.packets_decoded.load(Ordering::Relaxed),
            bad_tails: self.bad_tails.load(Ordering::Relaxed),
            oversized_lengths: self.oversized_lengths.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            unexpected_body_lengths: self.unexpected_body_lengths.load(Ordering::Relaxed),
            error_reports: self.error_reports.load(Ordering::Relaxed),
            alarms: self.alarms.load(Ordering::Relaxed),
            unknown_commands: self.unknown_commands.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            watchdog_expirations: self.watchdog_expirations.load(Ordering::Relaxed),
        }
    }
}
