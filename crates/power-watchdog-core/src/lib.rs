//! Resilient BLE client for Hughes Power Watchdog surge protectors.
//!
//! This crate keeps a Power Watchdog streaming over Bluetooth Low Energy and
//! exposes the latest decoded measurements to whoever hosts it.
//!
//! # Features
//!
//! - **Discovery**: Scan every adapter and classify Gen1 and Gen2 devices
//! - **Framed protocol**: Reassemble packets from arbitrarily split notifications
//! - **Live measurements**: Single (30A) and dual (50A) line reports
//! - **Auto-reconnection**: Growing backoff after any failure
//! - **Link watchdog**: Reconnect when a connected link goes silent
//! - **Testable**: Every radio call goes through a trait with a mock implementation
//!
//! # Connection lifecycle
//!
//! A [`ConnectionSupervisor`] owns one device. It scans for the address,
//! connects, enables notifications, writes the handshake and then streams
//! until the link drops or the watchdog expires, after which it backs off
//! and starts over. The host reads state through a [`SupervisorHandle`]:
//!
//! | Method | Returns |
//! |--------|---------|
//! | [`SupervisorHandle::connected`] | whether the device is streaming |
//! | [`SupervisorHandle::snapshot`] | copy of the latest measurements |
//! | [`SupervisorHandle::state`] | current [`ConnectionState`] |
//! | [`SupervisorHandle::subscribe_events`] | [`LinkEvent`] receiver |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use power_watchdog_core::{BtleTransport, ConnectionSupervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleTransport::new().await?);
//!     let config = SupervisorConfig::new("24:DC:C3:00:11:22");
//!     let mut handle = ConnectionSupervisor::new(transport, config)?.spawn();
//!
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     let snapshot = handle.snapshot();
//!     if handle.connected() {
//!         println!("L1: {:.1} V {:.2} A", snapshot.line1.input_voltage, snapshot.line1.current);
//!     }
//!
//!     handle.stop(Duration::from_secs(10)).await;
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod metrics;
pub mod mock;
pub mod reassembler;
pub mod reconnect;
pub mod retry;
pub mod scan;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod watchdog;

// Core exports
pub use error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
pub use supervisor::{ConnectionState, ConnectionSupervisor, SupervisorConfig, SupervisorHandle};
pub use transport::{Advertisement, Link, NotificationStream, Transport};

pub use btle::{BtleLink, BtleTransport};
pub use dispatch::PacketDispatcher;
pub use events::{DisconnectReason, EventDispatcher, EventReceiver, EventSender, LinkEvent};
pub use metrics::{LinkMetrics, LinkMetricsSnapshot};
pub use mock::{MockLink, MockStage, MockTransport, ScanOutcome};
pub use reassembler::{Packet, Reassembler, ReassemblyEvent};
pub use reconnect::{Backoff, ReconnectOptions};
pub use retry::{RetryConfig, with_retry_if};
pub use scan::{DiscoveryOptions, DiscoveryRunner, discover};
pub use store::MeasurementStore;
pub use watchdog::{LinkWatchdog, WatchdogFeeder};

// Re-export from power-watchdog-types
pub use power_watchdog_types::uuid as uuids;
pub use power_watchdog_types::{
    Command, DiscoveredDevice, DlReport, Generation, LineMeasurement, LineTopology, ParseError,
    WatchdogSnapshot, classify,
};
pub use power_watchdog_types::{protocol, types};
