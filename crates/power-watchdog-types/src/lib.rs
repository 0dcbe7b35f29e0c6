//! Platform-agnostic types for Hughes Power Watchdog surge protectors.
//!
//! This crate holds everything about the wire protocol that does not need a
//! radio: packet constants, the line decoder, DLReport bodies, advertisement
//! name classification and the snapshot type consumers read. The async BLE
//! client lives in `power-watchdog-core`.
//!
//! # Example
//!
//! ```
//! use power_watchdog_types::{DlReport, LineMeasurement};
//!
//! let line = LineMeasurement {
//!     input_voltage: 120.0,
//!     frequency: 60.0,
//!     ..LineMeasurement::default()
//! };
//! let report = DlReport::from_body(&line.to_bytes()).unwrap();
//! assert!(report.line2().is_none());
//! ```

pub mod classify;
pub mod error;
pub mod protocol;
pub mod types;
pub mod uuid;

pub use classify::classify;
pub use error::{ParseError, ParseResult};
pub use protocol::{Command, PacketHeader};
pub use types::{
    DiscoveredDevice, DlReport, Generation, LineMeasurement, LineTopology, WatchdogSnapshot,
};
pub use uuid as uuids;
