//! Bluetooth UUIDs for Power Watchdog devices.

use uuid::{Uuid, uuid};

/// The single GATT characteristic used for both notifications and writes.
pub const WATCHDOG_CHARACTERISTIC: Uuid = uuid!("0000ff01-0000-1000-8000-00805f9b34fb");
