//! Device classification from BLE advertisement names.
//!
//! Two naming schemes are in the field:
//!
//! - Generation 2: `WD_<typecode>_<serial>`, e.g. `WD_E7_26ec4ae469a5`. The
//!   second character of the typecode encodes the topology (`5`/`6` single,
//!   `7`/`8`/`9` double).
//! - Generation 1: a 19-character name starting with `PM`, possibly padded
//!   with trailing whitespace. The third character is `S` (single) or
//!   `D` (double).

use crate::types::{DiscoveredDevice, Generation, LineTopology};

/// Prefix of generation 2 names.
pub const GEN2_PREFIX: &str = "WD_";

/// Prefix of generation 1 names.
pub const GEN1_PREFIX: &str = "PM";

/// Exact length of a generation 1 name after trimming trailing whitespace.
pub const GEN1_NAME_LEN: usize = 19;

const GEN2_DELIMITER: char = '_';

/// Classify an advertisement name.
///
/// Returns `None` for anything that is not a Power Watchdog. The returned
/// device has an empty address; the scanner fills it in.
///
/// # Example
///
/// ```
/// use power_watchdog_types::{classify, Generation, LineTopology};
///
/// let device = classify("WD_E7_26ec4ae469a5").unwrap();
/// assert_eq!(device.generation, Generation::Gen2);
/// assert_eq!(device.device_type, "E7");
/// assert_eq!(device.topology, LineTopology::Double);
///
/// assert!(classify("WD_E7").is_none());
/// ```
#[must_use]
pub fn classify(name: &str) -> Option<DiscoveredDevice> {
    if name.is_empty() {
        return None;
    }

    if name.starts_with(GEN2_PREFIX) {
        return classify_gen2(name);
    }

    if name.starts_with(GEN1_PREFIX) {
        return classify_gen1(name);
    }

    None
}

fn classify_gen2(name: &str) -> Option<DiscoveredDevice> {
    let parts: Vec<&str> = name.split(GEN2_DELIMITER).collect();
    let [_, typecode, _] = parts.as_slice() else {
        return None;
    };

    let mut chars = typecode.chars();
    let topology = match (chars.next(), chars.next(), chars.next()) {
        (Some(_), Some('5' | '6'), None) => LineTopology::Single,
        (Some(_), Some('7' | '8' | '9'), None) => LineTopology::Double,
        _ => LineTopology::Unknown,
    };

    Some(DiscoveredDevice {
        address: String::new(),
        name: name.to_string(),
        generation: Generation::Gen2,
        device_type: (*typecode).to_string(),
        topology,
    })
}

fn classify_gen1(name: &str) -> Option<DiscoveredDevice> {
    let trimmed = name.trim_end();
    if trimmed.chars().count() != GEN1_NAME_LEN {
        return None;
    }

    let topology = match trimmed.chars().nth(2) {
        Some('S') => LineTopology::Single,
        Some('D') => LineTopology::Double,
        _ => LineTopology::Unknown,
    };

    Some(DiscoveredDevice {
        address: String::new(),
        name: name.to_string(),
        generation: Generation::Gen1,
        device_type: trimmed.chars().take(3).collect(),
        topology,
    })
}
