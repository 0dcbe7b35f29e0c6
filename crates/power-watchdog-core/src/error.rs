//! Error types for power-watchdog-core.
//!
//! Almost nothing here is fatal. The supervisor turns every link error into
//! a backoff and every protocol error into dropped bytes; these types mostly
//! surface from the transport, the scanner and configuration validation.
//!
//! | Error Type | Handling |
//! |------------|----------|
//! | [`Error::Timeout`] | Backoff and reconnect |
//! | [`Error::Bluetooth`] | Backoff and reconnect |
//! | [`Error::DeviceNotFound`] | Backoff and rescan |
//! | [`Error::ConnectionFailed`] | Backoff and reconnect |
//! | [`Error::SubscribeFailed`] | Backoff and reconnect |
//! | [`Error::WriteFailed`] | Backoff and reconnect |
//! | [`Error::ScanInProgress`] | Retry the scan with growing delay |
//! | [`Error::InvalidConfig`] | Fix configuration |
//! | [`Error::Cancelled`] | Shutdown in progress |

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when talking to a Power Watchdog.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Operation attempted while not connected to the device.
    #[error("Not connected to device")]
    NotConnected,

    /// The watchdog characteristic is missing from the device's services.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device address that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// Enabling notifications failed.
    #[error("Subscribe failed for characteristic {uuid}: {reason}")]
    SubscribeFailed {
        /// The characteristic UUID.
        uuid: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Write operation failed.
    #[error("Write failed to characteristic {uuid}: {reason}")]
    WriteFailed {
        /// The characteristic UUID.
        uuid: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The adapter refused to start a scan because one is already running.
    #[error("Scan already in progress on adapter {adapter}")]
    ScanInProgress {
        /// Adapter name.
        adapter: String,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Device is out of range.
    OutOfRange,
    /// Device rejected the connection.
    Rejected,
    /// Connection or service discovery timed out.
    Timeout,
    /// Generic BLE error.
    BleError(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange => write!(f, "device out of range"),
            Self::Rejected => write!(f, "connection rejected by device"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
        }
    }
}

/// Reason why a device was not found.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Scan timed out before finding the device.
    ScanTimeout { duration: Duration },
    /// No Bluetooth adapter available (or none matching the hint).
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScanTimeout { duration } => write!(f, "scan timed out after {:?}", duration),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Create a scan-busy error for an adapter.
    pub fn scan_in_progress(adapter: impl Into<String>) -> Self {
        Self::ScanInProgress {
            adapter: adapter.into(),
        }
    }

    /// Whether this is the "scan already running" class of failure.
    #[must_use]
    pub fn is_scan_busy(&self) -> bool {
        matches!(self, Error::ScanInProgress { .. })
    }
}

/// Result type alias using power-watchdog-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::connection_failed(
            Some("AA:BB:CC:DD:EE:FF".to_string()),
            ConnectionFailureReason::Rejected,
        );
        assert_eq!(err.to_string(), "Connection failed: connection rejected by device");

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to device");

        let err = Error::characteristic_not_found("0000ff01", 3);
        assert!(err.to_string().contains("0000ff01"));
        assert!(err.to_string().contains("3 services"));

        let err = Error::timeout("connect", Duration::from_secs(15));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("15s"));

        let err = Error::scan_in_progress("hci0");
        assert!(err.to_string().contains("hci0"));
    }

    #[test]
    fn test_device_not_found_reasons() {
        let err = Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter);
        assert!(err.to_string().contains("no Bluetooth adapter"));

        let err = Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
            duration: Duration::from_secs(20),
        });
        assert!(err.to_string().contains("20s"));
    }

    #[test]
    fn test_scan_busy_classification() {
        assert!(Error::scan_in_progress("hci0").is_scan_busy());
        assert!(!Error::NotConnected.is_scan_busy());
        assert!(!Error::Cancelled.is_scan_busy());
    }

    #[test]
    fn test_connection_failure_reasons() {
        let err = Error::connection_failed(None, ConnectionFailureReason::Timeout);
        assert!(err.to_string().contains("timed out"));

        let err = Error::connection_failed(
            None,
            ConnectionFailureReason::BleError("le-connection-abort-by-local".to_string()),
        );
        assert!(err.to_string().contains("le-connection-abort-by-local"));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }
}
